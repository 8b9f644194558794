//! 本地函数注册表
//!
//! 宿主闭包按名字注册，脚本调用时经由 [`NativeFunctionRegistry::guarded_call`] 分发：
//! 处理函数返回的错误、panic 以及 Error 标签的返回值都会变成 `BridgeError::Handler`。

use std::collections::HashMap;
use std::convert::TryFrom;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

use crate::core::error::{BridgeError, BridgeResult};
use crate::value::DynamicValue;

/// 处理函数错误
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<BridgeError> for HandlerError {
    fn from(err: BridgeError) -> Self {
        Self::new(err.to_string())
    }
}

pub type HandlerResult = Result<DynamicValue, HandlerError>;

/// 可从脚本调用的宿主函数
pub trait NativeFunction: Send + Sync {
    fn call(&self, args: &[DynamicValue]) -> HandlerResult;
}

impl<F> NativeFunction for F
where
    F: Fn(&[DynamicValue]) -> HandlerResult + Send + Sync,
{
    fn call(&self, args: &[DynamicValue]) -> HandlerResult {
        self(args)
    }
}

/// 取出第 `index` 个参数并转换为 `T`，缺失的参数按 Nil 处理
pub fn argument<T>(args: &[DynamicValue], index: usize) -> Result<T, HandlerError>
where
    T: TryFrom<DynamicValue, Error = BridgeError>,
{
    let value = args.get(index).cloned().unwrap_or_default();
    T::try_from(value).map_err(|err| {
        HandlerError::new(format!("bad argument #{}: {}", index + 1, conversion_detail(&err)))
    })
}

fn conversion_detail(err: &BridgeError) -> String {
    match err {
        BridgeError::Conversion(detail) => detail.clone(),
        other => other.to_string(),
    }
}

/// 校验方法名并拆分成路径段
///
/// 名字由点号分隔，每段都必须是合法的 Lua 标识符。
pub fn split_name(name: &str) -> BridgeResult<Vec<&str>> {
    let segments: Vec<&str> = name.split('.').collect();
    let valid = !name.is_empty() && segments.iter().all(|s| is_identifier(s));
    if valid {
        Ok(segments)
    } else {
        Err(BridgeError::Conversion(format!(
            "'{}' is not a valid method name",
            name
        )))
    }
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

/// 本地函数注册表
#[derive(Default)]
pub struct NativeFunctionRegistry {
    handlers: HashMap<String, Arc<dyn NativeFunction>>,
}

impl NativeFunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理函数
    ///
    /// 名字已被占用时返回 `AlreadyRegistered`，原处理函数保持不变。
    pub fn register(&mut self, name: &str, handler: Arc<dyn NativeFunction>) -> BridgeResult<()> {
        split_name(name)?;
        if self.handlers.contains_key(name) {
            return Err(BridgeError::AlreadyRegistered(name.to_string()));
        }
        self.handlers.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn NativeFunction>> {
        self.handlers.get(name).cloned()
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// 已注册的名字（排序后）
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// 按名字调用
    pub fn invoke(&self, name: &str, args: &[DynamicValue]) -> BridgeResult<DynamicValue> {
        let handler = self
            .resolve(name)
            .ok_or_else(|| BridgeError::NotFound(name.to_string()))?;
        Self::guarded_call(name, handler.as_ref(), args)
    }

    /// 调用处理函数并把所有失败方式统一为 `BridgeError::Handler`
    pub fn guarded_call(
        name: &str,
        handler: &dyn NativeFunction,
        args: &[DynamicValue],
    ) -> BridgeResult<DynamicValue> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.call(args)));
        let message = match outcome {
            Ok(Ok(DynamicValue::Error(err))) => err.message().to_string(),
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => err.message,
            Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
        };
        tracing::debug!(target: "script_bridge", "native handler '{}' failed: {}", name, message);
        Err(BridgeError::Handler {
            name: name.to_string(),
            message,
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
