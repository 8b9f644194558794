//! 动态值
//!
//! `DynamicValue` 是宿主与脚本引擎之间唯一的交换类型。标签唯一决定载荷，
//! 宿主侧的 `From`/`TryFrom` 转换见 [`convert`]，引擎侧的编解码见 [`crate::codec`]。

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use mlua::RegistryKey;
use serde::{Deserialize, Serialize};

use crate::core::error::{BridgeError, ErrorKind};
use crate::registry::{HandlerResult, NativeFunction};

pub mod convert;

/// 值类型标签
///
/// 数值与旧接口的枚举保持一致，Error 固定为 -1。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ValueType {
    Error = -1,
    Nil = 0,
    Number = 1,
    Boolean = 2,
    String = 3,
    Array = 4,
    Map = 5,
    Pointer = 6,
    Object = 7,
    Integer = 8,
    Data = 9,
    Function = 10,
    Tuple = 11,
}

impl ValueType {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::Error => "error",
            ValueType::Nil => "nil",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::String => "string",
            ValueType::Array => "array",
            ValueType::Map => "map",
            ValueType::Pointer => "pointer",
            ValueType::Object => "object",
            ValueType::Integer => "integer",
            ValueType::Data => "data",
            ValueType::Function => "function",
            ValueType::Tuple => "tuple",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 跨越宿主/脚本边界的值
#[derive(Clone, Default)]
pub enum DynamicValue {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Array(Vec<DynamicValue>),
    Map(ValueMap),
    /// 不透明地址，不拥有、不解引用
    Pointer(OpaquePtr),
    /// 与宿主共享所有权的对象引用
    Object(HostObject),
    Data(Vec<u8>),
    Function(FunctionRef),
    /// 多返回值
    Tuple(Vec<DynamicValue>),
    /// 只由错误通道产生
    Error(ErrorValue),
}

impl DynamicValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            DynamicValue::Nil => ValueType::Nil,
            DynamicValue::Boolean(_) => ValueType::Boolean,
            DynamicValue::Integer(_) => ValueType::Integer,
            DynamicValue::Number(_) => ValueType::Number,
            DynamicValue::String(_) => ValueType::String,
            DynamicValue::Array(_) => ValueType::Array,
            DynamicValue::Map(_) => ValueType::Map,
            DynamicValue::Pointer(_) => ValueType::Pointer,
            DynamicValue::Object(_) => ValueType::Object,
            DynamicValue::Data(_) => ValueType::Data,
            DynamicValue::Function(_) => ValueType::Function,
            DynamicValue::Tuple(_) => ValueType::Tuple,
            DynamicValue::Error(_) => ValueType::Error,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.value_type().name()
    }

    /// 字节数据
    pub fn data(bytes: impl Into<Vec<u8>>) -> Self {
        DynamicValue::Data(bytes.into())
    }

    pub fn tuple(values: impl IntoIterator<Item = DynamicValue>) -> Self {
        DynamicValue::Tuple(values.into_iter().collect())
    }

    /// 把错误放进错误通道
    pub(crate) fn from_error(err: &BridgeError) -> Self {
        DynamicValue::Error(ErrorValue::from(err))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, DynamicValue::Nil)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, DynamicValue::Error(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynamicValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            DynamicValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Integer 会被提升为浮点数
    pub fn as_number(&self) -> Option<f64> {
        match self {
            DynamicValue::Number(n) => Some(*n),
            DynamicValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynamicValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DynamicValue::Data(bytes) => Some(bytes),
            DynamicValue::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[DynamicValue]> {
        match self {
            DynamicValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            DynamicValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[DynamicValue]> {
        match self {
            DynamicValue::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            DynamicValue::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&FunctionRef> {
        match self {
            DynamicValue::Function(func) => Some(func),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&ErrorValue> {
        match self {
            DynamicValue::Error(err) => Some(err),
            _ => None,
        }
    }

    /// 错误通道转回 Result
    pub fn into_result(self) -> Result<DynamicValue, ErrorValue> {
        match self {
            DynamicValue::Error(err) => Err(err),
            other => Ok(other),
        }
    }
}

impl PartialEq for DynamicValue {
    fn eq(&self, other: &Self) -> bool {
        use DynamicValue::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Pointer(a), Pointer(b)) => a == b,
            (Object(a), Object(b)) => a == b,
            (Data(a), Data(b)) => a == b,
            (Function(a), Function(b)) => a == b,
            (Tuple(a), Tuple(b)) => a == b,
            (Error(a), Error(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for DynamicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicValue::Nil => write!(f, "Nil"),
            DynamicValue::Boolean(b) => write!(f, "Boolean({})", b),
            DynamicValue::Integer(i) => write!(f, "Integer({})", i),
            DynamicValue::Number(n) => write!(f, "Number({})", n),
            DynamicValue::String(s) => write!(f, "String({:?})", s),
            DynamicValue::Array(items) => f.debug_tuple("Array").field(items).finish(),
            DynamicValue::Map(map) => f.debug_tuple("Map").field(map).finish(),
            DynamicValue::Pointer(ptr) => write!(f, "Pointer({:?})", ptr),
            DynamicValue::Object(obj) => write!(f, "Object({:?})", obj),
            DynamicValue::Data(bytes) => write!(f, "Data({} bytes)", bytes.len()),
            DynamicValue::Function(func) => write!(f, "Function({:?})", func),
            DynamicValue::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            DynamicValue::Error(err) => write!(f, "Error({:?})", err),
        }
    }
}

/// 无序键值映射
///
/// 键唯一；相等比较与插入顺序无关。
#[derive(Clone, Default)]
pub struct ValueMap {
    entries: Vec<(DynamicValue, DynamicValue)>,
}

impl ValueMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// 插入键值，返回被替换的旧值
    pub fn insert(
        &mut self,
        key: impl Into<DynamicValue>,
        value: impl Into<DynamicValue>,
    ) -> Option<DynamicValue> {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.entries.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &DynamicValue) -> Option<&DynamicValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// 按字符串键查找
    pub fn get_str(&self, key: &str) -> Option<&DynamicValue> {
        self.entries
            .iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &DynamicValue) -> Option<DynamicValue> {
        let idx = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.swap_remove(idx).1)
    }

    pub fn contains_key(&self, key: &DynamicValue) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DynamicValue, &DynamicValue)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

impl PartialEq for ValueMap {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).map_or(false, |ov| ov == v))
    }
}

impl fmt::Debug for ValueMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K: Into<DynamicValue>, V: Into<DynamicValue>> FromIterator<(K, V)> for ValueMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl IntoIterator for ValueMap {
    type Item = (DynamicValue, DynamicValue);
    type IntoIter = std::vec::IntoIter<(DynamicValue, DynamicValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// 不透明指针
///
/// 只保存地址；桥接层从不解引用，也不负责其生命周期。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpaquePtr(usize);

impl OpaquePtr {
    pub fn from_raw<T>(ptr: *const T) -> Self {
        OpaquePtr(ptr as usize)
    }

    pub fn from_addr(addr: usize) -> Self {
        OpaquePtr(addr)
    }

    pub fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for OpaquePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// 宿主对象引用
///
/// 所有权与宿主共享，生命周期由最后一个持有者决定。相等即引用相同。
#[derive(Clone)]
pub struct HostObject(Arc<dyn Any + Send + Sync>);

impl HostObject {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        HostObject(Arc::new(value))
    }

    pub fn from_arc(inner: Arc<dyn Any + Send + Sync>) -> Self {
        HostObject(inner)
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.0.is::<T>()
    }

    pub fn ptr_eq(&self, other: &HostObject) -> bool {
        self.addr() == other.addr()
    }

    /// 当前持有者数量
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub(crate) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostObject({:#x})", self.addr())
    }
}

/// 可调用引用：宿主函数或脚本函数
#[derive(Clone)]
pub enum FunctionRef {
    Host(Arc<dyn NativeFunction>),
    Script(ScriptFunction),
}

impl FunctionRef {
    /// 用闭包构造宿主函数
    pub fn host<F>(func: F) -> Self
    where
        F: Fn(&[DynamicValue]) -> HandlerResult + Send + Sync + 'static,
    {
        FunctionRef::Host(Arc::new(func))
    }

    pub fn is_script(&self) -> bool {
        matches!(self, FunctionRef::Script(_))
    }
}

impl PartialEq for FunctionRef {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FunctionRef::Host(a), FunctionRef::Host(b)) => {
                Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
            }
            (FunctionRef::Script(a), FunctionRef::Script(b)) => Arc::ptr_eq(&a.key, &b.key),
            _ => false,
        }
    }
}

impl fmt::Debug for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionRef::Host(func) => {
                write!(f, "Host({:#x})", Arc::as_ptr(func) as *const () as usize)
            }
            FunctionRef::Script(func) => write!(f, "Script(bridge={})", func.bridge_id),
        }
    }
}

/// 脚本函数句柄
///
/// 指向引擎注册表中的函数，只在产生它的那个桥上有效。
#[derive(Clone)]
pub struct ScriptFunction {
    pub(crate) bridge_id: u64,
    pub(crate) key: Arc<RegistryKey>,
}

impl ScriptFunction {
    pub fn bridge_id(&self) -> u64 {
        self.bridge_id
    }
}

/// 错误载荷
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorValue {
    kind: ErrorKind,
    message: String,
    line: Option<u32>,
}

impl ErrorValue {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn line(&self) -> Option<u32> {
        self.line
    }
}

impl From<&BridgeError> for ErrorValue {
    fn from(err: &BridgeError) -> Self {
        ErrorValue {
            kind: err.kind(),
            message: err.to_string(),
            line: err.line(),
        }
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
