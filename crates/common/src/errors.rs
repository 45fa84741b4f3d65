use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("无效的地址范围: {0}")]
    InvalidRange(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("状态冲突: {0}")]
    Conflict(String),

    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    #[error("任务队列已满 (容量 {0})")]
    QueueFull(usize),

    #[error("非法状态迁移: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("数据库错误: {0}")]
    Database(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 是否属于调用方可修正的请求错误（不重试）
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::InvalidRange(_)
                | Error::NotFound(_)
                | Error::Conflict(_)
                | Error::InvalidTransition { .. }
        )
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
