use std::fmt;

#[derive(Debug)]
pub enum RentChatSDKError {
    /// 本地没有登录令牌，无法建立通道或调用 REST 接口
    AuthMissing,
    NotConnected,
    Transport(String),
    Http(String),
    JsonError(String),
    IO(String),
    Timeout(String),
    InvalidArgument(String),
    Config(String),
    Other(String),
}

impl fmt::Display for RentChatSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RentChatSDKError::AuthMissing => write!(f, "Missing auth token"),
            RentChatSDKError::NotConnected => write!(f, "Not connected"),
            RentChatSDKError::Transport(e) => write!(f, "Transport error: {}", e),
            RentChatSDKError::Http(e) => write!(f, "HTTP error: {}", e),
            RentChatSDKError::JsonError(e) => write!(f, "JSON error: {}", e),
            RentChatSDKError::IO(e) => write!(f, "IO error: {}", e),
            RentChatSDKError::Timeout(e) => write!(f, "Timeout: {}", e),
            RentChatSDKError::InvalidArgument(e) => write!(f, "Invalid argument: {}", e),
            RentChatSDKError::Config(e) => write!(f, "Config error: {}", e),
            RentChatSDKError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for RentChatSDKError {}

impl From<serde_json::Error> for RentChatSDKError {
    fn from(error: serde_json::Error) -> Self {
        RentChatSDKError::JsonError(error.to_string())
    }
}

impl From<reqwest::Error> for RentChatSDKError {
    fn from(error: reqwest::Error) -> Self {
        RentChatSDKError::Http(error.to_string())
    }
}

impl From<std::io::Error> for RentChatSDKError {
    fn from(error: std::io::Error) -> Self {
        RentChatSDKError::IO(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RentChatSDKError>;
