/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A header line could not be parsed.
    #[error("malformed header: {0}")]
    MalformedHeader(String),

    /// A required header is absent from the header block.
    #[error("missing required header: {0}")]
    MissingField(&'static str),

    /// The stream ended before the declared body was complete.
    #[error("short body ({actual} of {expected} bytes before end of stream)")]
    ShortBody { expected: usize, actual: usize },

    /// The stream ended inside a header block.
    #[error("stream ended inside a header block ({0} bytes buffered)")]
    TruncatedHeader(usize),

    /// The header block exceeds the configured maximum size.
    #[error("header block too large (more than {max} bytes)")]
    HeaderTooLarge { max: usize },

    /// The declared body exceeds the configured maximum size.
    #[error("body too large ({size} bytes, max {max})")]
    BodyTooLarge { size: usize, max: usize },

    /// A frame cannot be represented on the wire.
    #[error("cannot encode frame: {0}")]
    Unencodable(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended cleanly between frames.
    #[error("end of stream")]
    Eof,
}

impl FrameError {
    /// True for the normal end-of-stream signal.
    pub fn is_clean_eof(&self) -> bool {
        matches!(self, FrameError::Eof)
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
