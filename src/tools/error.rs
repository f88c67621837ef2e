/// Generic DTN stack error
#[derive(Debug)]
pub struct DtnError(pub std::io::Error);

///
pub type Result<T> = std::result::Result<T, DtnError>;

impl DtnError {
    /// Return a new error with a message
    pub fn new<E>(msg: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>> + std::fmt::Debug,
    {
        log::error!("{:?}", msg);
        DtnError(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    /// Return a new error of a specific kind
    pub fn new_kind<E>(kind: std::io::ErrorKind, msg: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>> + std::fmt::Debug,
    {
        log::error!("{:?}", msg);
        DtnError(std::io::Error::new(kind, msg))
    }

    /// Kind of the underlying I/O error
    pub fn kind(&self) -> std::io::ErrorKind {
        self.0.kind()
    }
}

impl std::fmt::Display for DtnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for DtnError {}

impl From<std::io::Error> for DtnError {
    fn from(err: std::io::Error) -> Self {
        log::error!("{:?}", err);
        DtnError(err)
    }
}
