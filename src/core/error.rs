//! 统一错误处理模块
//!
//! 提供桥接层范围内的统一错误类型定义
//!
//! ## 错误分类
//!
//! - **引擎侧错误**: 编译错误、运行时错误、执行预算耗尽
//! - **边界错误**: 值转换失败、循环结构、嵌套过深
//! - **宿主侧错误**: 文件读取失败、本地函数失败、重复注册、桥已关闭
//!
//! `BridgeError` 是所有公开操作返回的唯一错误类型；`ErrorKind` 是它的扁平标签，
//! 同时也随 Error 标签的 `DynamicValue` 一起跨越边界。

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 桥接层错误类型
#[derive(Error, Debug, Clone)]
pub enum BridgeError {
    #[error("failed to read script '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error("compile error{}: {message}", fmt_line(.line))]
    Compile { message: String, line: Option<u32> },

    #[error("runtime error{}: {message}", fmt_line(.line))]
    Runtime { message: String, line: Option<u32> },

    #[error("conversion error: {0}")]
    Conversion(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("method already registered: {0}")]
    AlreadyRegistered(String),

    #[error("script bridge is closed")]
    Closed,

    #[error("cyclic table cannot be marshalled")]
    CyclicValue,

    #[error("value nesting exceeds the configured depth of {0}")]
    DepthExceeded(usize),

    #[error("native handler '{name}' failed: {message}")]
    Handler { name: String, message: String },

    #[error("script exceeded its budget of {0} instructions")]
    InstructionLimit(u64),

    #[error("script bridge re-entered from its own engine thread")]
    Reentrant,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("bridge worker unavailable: {0}")]
    WorkerUnavailable(String),
}

fn fmt_line(line: &Option<u32>) -> String {
    match line {
        Some(line) => format!(" at line {}", line),
        None => String::new(),
    }
}

/// 错误种类标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Io,
    Compile,
    Runtime,
    Conversion,
    NotFound,
    AlreadyRegistered,
    BridgeClosed,
    CyclicValue,
    DepthExceeded,
    Handler,
    InstructionLimit,
    Reentrant,
    Config,
}

impl ErrorKind {
    /// 旧式状态码：0 表示成功，每个种类一个非零值
    pub fn status_code(self) -> i32 {
        match self {
            ErrorKind::Io => 1,
            ErrorKind::Compile => 2,
            ErrorKind::Runtime => 3,
            ErrorKind::Conversion => 4,
            ErrorKind::NotFound => 5,
            ErrorKind::AlreadyRegistered => 6,
            ErrorKind::BridgeClosed => 7,
            ErrorKind::CyclicValue => 8,
            ErrorKind::DepthExceeded => 9,
            ErrorKind::Handler => 10,
            ErrorKind::InstructionLimit => 11,
            ErrorKind::Reentrant => 12,
            ErrorKind::Config => 13,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Io => "io",
            ErrorKind::Compile => "compile",
            ErrorKind::Runtime => "runtime",
            ErrorKind::Conversion => "conversion",
            ErrorKind::NotFound => "not_found",
            ErrorKind::AlreadyRegistered => "already_registered",
            ErrorKind::BridgeClosed => "bridge_closed",
            ErrorKind::CyclicValue => "cyclic_value",
            ErrorKind::DepthExceeded => "depth_exceeded",
            ErrorKind::Handler => "handler",
            ErrorKind::InstructionLimit => "instruction_limit",
            ErrorKind::Reentrant => "reentrant",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BridgeError {
    /// 获取错误种类
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Io { .. } => ErrorKind::Io,
            BridgeError::Compile { .. } => ErrorKind::Compile,
            BridgeError::Runtime { .. } => ErrorKind::Runtime,
            BridgeError::Conversion(_) => ErrorKind::Conversion,
            BridgeError::NotFound(_) => ErrorKind::NotFound,
            BridgeError::AlreadyRegistered(_) => ErrorKind::AlreadyRegistered,
            BridgeError::Closed | BridgeError::WorkerUnavailable(_) => ErrorKind::BridgeClosed,
            BridgeError::CyclicValue => ErrorKind::CyclicValue,
            BridgeError::DepthExceeded(_) => ErrorKind::DepthExceeded,
            BridgeError::Handler { .. } => ErrorKind::Handler,
            BridgeError::InstructionLimit(_) => ErrorKind::InstructionLimit,
            BridgeError::Reentrant => ErrorKind::Reentrant,
            BridgeError::Config(_) => ErrorKind::Config,
        }
    }

    /// 脚本源码中的行号（如果引擎提供了位置信息）
    pub fn line(&self) -> Option<u32> {
        match self {
            BridgeError::Compile { line, .. } | BridgeError::Runtime { line, .. } => *line,
            _ => None,
        }
    }

    pub fn status_code(&self) -> i32 {
        self.kind().status_code()
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BridgeError::Io {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// 从引擎报告的消息构造编译错误
    pub(crate) fn compile(message: impl Into<String>) -> Self {
        let message = trim_traceback(message.into());
        let line = parse_line(&message);
        BridgeError::Compile { message, line }
    }

    /// 从引擎报告的消息构造运行时错误
    pub(crate) fn runtime(message: impl Into<String>) -> Self {
        let message = trim_traceback(message.into());
        let line = parse_line(&message);
        BridgeError::Runtime { message, line }
    }
}

impl From<mlua::Error> for BridgeError {
    /// 引擎错误分类
    ///
    /// 先沿回调/外部错误的包装链查找由本库抛出的 `BridgeError`，找到则原样恢复。
    fn from(err: mlua::Error) -> Self {
        if let Some(inner) = find_bridge_error(&err) {
            return inner.clone();
        }
        match err {
            mlua::Error::SyntaxError { message, .. } => BridgeError::compile(message),
            mlua::Error::RuntimeError(message) => BridgeError::runtime(message),
            mlua::Error::MemoryError(message) => BridgeError::runtime(message),
            mlua::Error::CallbackError { cause, .. } => BridgeError::from((*cause).clone()),
            mlua::Error::WithContext { cause, .. } => BridgeError::from((*cause).clone()),
            mlua::Error::FromLuaConversionError { .. } | mlua::Error::ToLuaConversionError { .. } => {
                BridgeError::Conversion(err.to_string())
            }
            other => BridgeError::runtime(other.to_string()),
        }
    }
}

fn find_bridge_error(err: &mlua::Error) -> Option<&BridgeError> {
    match err {
        mlua::Error::ExternalError(inner) => inner.downcast_ref::<BridgeError>(),
        mlua::Error::CallbackError { cause, .. } => find_bridge_error(cause),
        mlua::Error::WithContext { cause, .. } => find_bridge_error(cause),
        _ => None,
    }
}

/// 把 `Result<(), BridgeError>` 折叠成旧式状态码
pub fn status_of<T>(result: &BridgeResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.status_code(),
    }
}

/// 去掉引擎附加的调用栈
fn trim_traceback(message: String) -> String {
    match message.find("\nstack traceback:") {
        Some(idx) => message[..idx].to_string(),
        None => message,
    }
}

/// 从 `chunk:LINE: message` 形式的引擎消息中取出行号
pub(crate) fn parse_line(message: &str) -> Option<u32> {
    let first = message.lines().next()?;
    let bytes = first.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' {
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
            if end > start && end < bytes.len() && bytes[end] == b':' {
                return first[start..end].parse().ok();
            }
        }
        i += 1;
    }
    None
}

/// 桥接层结果类型别名
pub type BridgeResult<T> = Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_from_chunk_message() {
        assert_eq!(parse_line("eval:3: attempt to call a nil value"), Some(3));
        assert_eq!(
            parse_line("[string \"main\"]:12: unexpected symbol near 'is'"),
            Some(12)
        );
        assert_eq!(parse_line("C:\\scripts\\a.lua:7: boom"), Some(7));
        assert_eq!(parse_line("no location here"), None);
        assert_eq!(parse_line("time 10:30 is not a location"), None);
    }

    #[test]
    fn test_runtime_error_strips_traceback() {
        let err = BridgeError::runtime("eval:2: boom\nstack traceback:\n\t[C]: in ?");
        match &err {
            BridgeError::Runtime { message, line } => {
                assert_eq!(message, "eval:2: boom");
                assert_eq!(*line, Some(2));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(err.to_string(), "runtime error at line 2: eval:2: boom");
    }

    #[test]
    fn test_status_codes_are_distinct() {
        let kinds = [
            ErrorKind::Io,
            ErrorKind::Compile,
            ErrorKind::Runtime,
            ErrorKind::Conversion,
            ErrorKind::NotFound,
            ErrorKind::AlreadyRegistered,
            ErrorKind::BridgeClosed,
            ErrorKind::CyclicValue,
            ErrorKind::DepthExceeded,
            ErrorKind::Handler,
            ErrorKind::InstructionLimit,
            ErrorKind::Reentrant,
            ErrorKind::Config,
        ];
        let mut codes: Vec<i32> = kinds.iter().map(|k| k.status_code()).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_status_of_result() {
        let ok: BridgeResult<()> = Ok(());
        assert_eq!(status_of(&ok), 0);

        let err: BridgeResult<()> = Err(BridgeError::NotFound("x".into()));
        assert_eq!(status_of(&err), ErrorKind::NotFound.status_code());
    }

    #[test]
    fn test_io_error_keeps_source() {
        let err = BridgeError::io(
            "/missing.lua",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("/missing.lua"));
    }

    #[test]
    fn test_engine_errors_are_classified() {
        let err: BridgeError = mlua::Error::SyntaxError {
            message: "eval:1: unexpected symbol near 'x'".into(),
            incomplete_input: false,
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Compile);
        assert_eq!(err.line(), Some(1));

        let err: BridgeError = mlua::Error::RuntimeError("eval:4: boom".into()).into();
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert_eq!(err.line(), Some(4));
    }

    #[test]
    fn test_bridge_error_recovered_through_callback() {
        let raised = mlua::Error::external(BridgeError::InstructionLimit(100));
        let wrapped = mlua::Error::CallbackError {
            traceback: "stack traceback:".into(),
            cause: Arc::new(raised),
        };
        let err: BridgeError = wrapped.into();
        assert!(matches!(err, BridgeError::InstructionLimit(100)));
    }

    #[test]
    fn test_worker_unavailable_reads_as_closed() {
        let err = BridgeError::WorkerUnavailable("channel closed".into());
        assert_eq!(err.kind(), ErrorKind::BridgeClosed);
    }
}
