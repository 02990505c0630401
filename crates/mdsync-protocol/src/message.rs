use mdsync_types::ByteRange;

/// Default server limit on a single request body (1 MiB).
pub const DEFAULT_MAX_POST: usize = 1024 * 1024;

/// All requests understood by a byte-store server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    List,
    Stat { name: String },
    Get { name: String },
    GetParts { name: String, ranges: Vec<ByteRange> },
    Put { name: String, body: Vec<u8> },
    Append { name: String, body: Vec<u8> },
    Delete { name: String },
    PutMany { files: Vec<(String, Vec<u8>)> },
    GetMany { names: Vec<String> },
}

impl Request {
    /// Operation name as sent on the wire (`r=<op>`).
    pub fn op(&self) -> &'static str {
        match self {
            Self::List => "list_files",
            Self::Stat { .. } => "stat",
            Self::Get { .. } => "get",
            Self::GetParts { .. } => "getparts",
            Self::Put { .. } => "put",
            Self::Append { .. } => "append",
            Self::Delete { .. } => "delete",
            Self::PutMany { .. } => "putmany",
            Self::GetMany { .. } => "getmany",
        }
    }

    /// Size of the request body that will be POSTed.
    pub fn body_len(&self) -> usize {
        match self {
            Self::Put { body, .. } | Self::Append { body, .. } => body.len(),
            Self::PutMany { files } => files.iter().map(|(_, data)| data.len()).sum(),
            _ => 0,
        }
    }

    /// The single file this request targets, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Stat { name }
            | Self::Get { name }
            | Self::GetParts { name, .. }
            | Self::Put { name, .. }
            | Self::Append { name, .. }
            | Self::Delete { name } => Some(name),
            _ => None,
        }
    }
}

/// Raw server response.
///
/// `sizes` is the side channel used by `getmany`: one entry per requested
/// file, `-1` when that file was missing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    pub body: Vec<u8>,
    pub sizes: Option<Vec<i64>>,
}

impl Response {
    pub fn body(body: Vec<u8>) -> Self {
        Self { body, sizes: None }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

/// Result of a `stat` request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_names_are_unique() {
        let requests = vec![
            Request::List,
            Request::Stat { name: "a".into() },
            Request::Get { name: "a".into() },
            Request::GetParts { name: "a".into(), ranges: vec![] },
            Request::Put { name: "a".into(), body: vec![] },
            Request::Append { name: "a".into(), body: vec![] },
            Request::Delete { name: "a".into() },
            Request::PutMany { files: vec![] },
            Request::GetMany { names: vec![] },
        ];
        let mut ops: Vec<_> = requests.iter().map(|r| r.op()).collect();
        let len = ops.len();
        ops.sort();
        ops.dedup();
        assert_eq!(ops.len(), len);
    }

    #[test]
    fn body_len_counts_payloads() {
        let put = Request::Put { name: "a".into(), body: vec![0; 7] };
        assert_eq!(put.body_len(), 7);
        let many = Request::PutMany {
            files: vec![("a".into(), vec![0; 3]), ("b".into(), vec![0; 4])],
        };
        assert_eq!(many.body_len(), 7);
        assert_eq!(Request::List.body_len(), 0);
    }

    #[test]
    fn name_of_single_file_requests() {
        assert_eq!(Request::Get { name: "DATA".into() }.name(), Some("DATA"));
        assert_eq!(Request::List.name(), None);
    }
}
