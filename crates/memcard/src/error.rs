use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// The superblock or a record failed structural validation.
    Format(String),
    /// A page could not be read, written or erased, or failed ECC.
    Media { page: Option<u32>, reason: String },
    /// The FAT links of a chain are inconsistent.
    CorruptChain { cluster: u32, reason: String },
    NotFound(String),
    NotDirectory(String),
    NotFile(String),
    AlreadyExists(String),
    NotEmpty(String),
    NoSpace { requested: u32, available: u32 },
    AuthRequired,
    AuthFailed(String),
    InvalidName(String),
    Config(String),
    IOError(std::io::Error),
}

impl Error {
    pub(crate) fn media(page: u32, reason: impl Into<String>) -> Self {
        Error::Media {
            page: Some(page),
            reason: reason.into(),
        }
    }

    pub(crate) fn corrupt(cluster: u32, reason: impl Into<String>) -> Self {
        Error::CorruptChain {
            cluster,
            reason: reason.into(),
        }
    }

    /// Stable numeric code reported at the command-line boundary.
    pub fn code(&self) -> i32 {
        match self {
            Error::Format(_) => -2,
            Error::NotFound(_) => -4,
            Error::IOError(_) => -5,
            Error::NotDirectory(_) => -100,
            Error::NotFile(_) => -101,
            Error::NotEmpty(_) => -102,
            Error::NoSpace { .. } => -103,
            Error::AlreadyExists(_) => -104,
            Error::AuthRequired => -105,
            Error::AuthFailed(_) => -106,
            Error::Media { .. } => -107,
            Error::CorruptChain { .. } => -108,
            Error::InvalidName(_) => -109,
            Error::Config(_) => -110,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Format(reason) => write!(f, "card is not formatted: {reason}"),
            Error::Media {
                page: Some(page),
                reason,
            } => write!(f, "media error on page {page}: {reason}"),
            Error::Media { page: None, reason } => write!(f, "media error: {reason}"),
            Error::CorruptChain { cluster, reason } => {
                write!(f, "corrupt cluster chain at cluster {cluster}: {reason}")
            }
            Error::NotFound(path) => write!(f, "{path}: no such file or directory"),
            Error::NotDirectory(path) => write!(f, "{path}: not a directory"),
            Error::NotFile(path) => write!(f, "{path}: not a file"),
            Error::AlreadyExists(path) => write!(f, "{path}: already exists"),
            Error::NotEmpty(path) => write!(f, "{path}: directory not empty"),
            Error::NoSpace {
                requested,
                available,
            } => write!(
                f,
                "no space left on card: {requested} clusters requested, {available} free"
            ),
            Error::AuthRequired => write!(f, "card must be authenticated before writing"),
            Error::AuthFailed(reason) => write!(f, "authentication failed: {reason}"),
            Error::InvalidName(name) => write!(f, "invalid entry name {name:?}"),
            Error::Config(reason) => write!(f, "{reason}"),
            Error::IOError(err) => write!(f, "{err:?}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IOError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IOError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_codes_are_stable() {
        assert_eq!(Error::Format("bad magic".into()).code(), -2);
        assert_eq!(Error::NotFound("/X".into()).code(), -4);
        assert_eq!(Error::NotDirectory("/X".into()).code(), -100);
        assert_eq!(Error::NotFile("/X".into()).code(), -101);
    }

    #[test]
    fn media_error_names_the_page() {
        let err = Error::media(42, "uncorrectable ECC error");
        assert_eq!(
            err.to_string(),
            "media error on page 42: uncorrectable ECC error"
        );
    }
}
