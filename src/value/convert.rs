//! 宿主原生类型与 `DynamicValue` 之间的转换

use std::collections::HashMap;
use std::convert::TryFrom;

use super::{DynamicValue, FunctionRef, HostObject, OpaquePtr, ValueMap};
use crate::core::error::BridgeError;

impl From<()> for DynamicValue {
    fn from(_: ()) -> Self {
        DynamicValue::Nil
    }
}

impl From<bool> for DynamicValue {
    fn from(value: bool) -> Self {
        DynamicValue::Boolean(value)
    }
}

impl From<i32> for DynamicValue {
    fn from(value: i32) -> Self {
        DynamicValue::Integer(value as i64)
    }
}

impl From<u32> for DynamicValue {
    fn from(value: u32) -> Self {
        DynamicValue::Integer(value as i64)
    }
}

impl From<i64> for DynamicValue {
    fn from(value: i64) -> Self {
        DynamicValue::Integer(value)
    }
}

impl From<f32> for DynamicValue {
    fn from(value: f32) -> Self {
        DynamicValue::Number(value as f64)
    }
}

impl From<f64> for DynamicValue {
    fn from(value: f64) -> Self {
        DynamicValue::Number(value)
    }
}

impl From<&str> for DynamicValue {
    fn from(value: &str) -> Self {
        DynamicValue::String(value.to_string())
    }
}

impl From<String> for DynamicValue {
    fn from(value: String) -> Self {
        DynamicValue::String(value)
    }
}

impl<T: Into<DynamicValue>> From<Option<T>> for DynamicValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(DynamicValue::Nil, Into::into)
    }
}

impl<T: Into<DynamicValue>> From<Vec<T>> for DynamicValue {
    fn from(values: Vec<T>) -> Self {
        DynamicValue::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<DynamicValue>> From<HashMap<String, T>> for DynamicValue {
    fn from(values: HashMap<String, T>) -> Self {
        DynamicValue::Map(values.into_iter().collect())
    }
}

impl From<ValueMap> for DynamicValue {
    fn from(map: ValueMap) -> Self {
        DynamicValue::Map(map)
    }
}

impl From<HostObject> for DynamicValue {
    fn from(obj: HostObject) -> Self {
        DynamicValue::Object(obj)
    }
}

impl From<OpaquePtr> for DynamicValue {
    fn from(ptr: OpaquePtr) -> Self {
        DynamicValue::Pointer(ptr)
    }
}

impl From<FunctionRef> for DynamicValue {
    fn from(func: FunctionRef) -> Self {
        DynamicValue::Function(func)
    }
}

fn mismatch(expected: &str, found: &DynamicValue) -> BridgeError {
    BridgeError::Conversion(format!("expected {}, found {}", expected, found.type_name()))
}

impl TryFrom<DynamicValue> for bool {
    type Error = BridgeError;

    fn try_from(value: DynamicValue) -> Result<Self, Self::Error> {
        match value {
            DynamicValue::Boolean(b) => Ok(b),
            other => Err(mismatch("boolean", &other)),
        }
    }
}

impl TryFrom<DynamicValue> for i64 {
    type Error = BridgeError;

    fn try_from(value: DynamicValue) -> Result<Self, Self::Error> {
        match value {
            DynamicValue::Integer(i) => Ok(i),
            // 只接受恰好为整数的浮点数
            DynamicValue::Number(n)
                if n.fract() == 0.0 && n >= i64::MIN as f64 && n < i64::MAX as f64 =>
            {
                Ok(n as i64)
            }
            other => Err(mismatch("integer", &other)),
        }
    }
}

impl TryFrom<DynamicValue> for i32 {
    type Error = BridgeError;

    fn try_from(value: DynamicValue) -> Result<Self, Self::Error> {
        let wide = i64::try_from(value)?;
        i32::try_from(wide)
            .map_err(|_| BridgeError::Conversion(format!("{} does not fit in i32", wide)))
    }
}

impl TryFrom<DynamicValue> for usize {
    type Error = BridgeError;

    fn try_from(value: DynamicValue) -> Result<Self, Self::Error> {
        let wide = i64::try_from(value)?;
        usize::try_from(wide)
            .map_err(|_| BridgeError::Conversion(format!("{} is not a valid index", wide)))
    }
}

impl TryFrom<DynamicValue> for f64 {
    type Error = BridgeError;

    fn try_from(value: DynamicValue) -> Result<Self, Self::Error> {
        value.as_number().ok_or_else(|| mismatch("number", &value))
    }
}

impl TryFrom<DynamicValue> for String {
    type Error = BridgeError;

    fn try_from(value: DynamicValue) -> Result<Self, Self::Error> {
        match value {
            DynamicValue::String(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }
}

impl TryFrom<DynamicValue> for HostObject {
    type Error = BridgeError;

    fn try_from(value: DynamicValue) -> Result<Self, Self::Error> {
        match value {
            DynamicValue::Object(obj) => Ok(obj),
            other => Err(mismatch("object", &other)),
        }
    }
}

// `Option<T>` 不能泛型实现：标准库的 `From<T> for Option<T>` 会与之冲突
macro_rules! impl_try_from_optional {
    ($($ty:ty),* $(,)?) => {
        $(
            impl TryFrom<DynamicValue> for Option<$ty> {
                type Error = BridgeError;

                fn try_from(value: DynamicValue) -> Result<Self, Self::Error> {
                    match value {
                        DynamicValue::Nil => Ok(None),
                        other => <$ty>::try_from(other).map(Some),
                    }
                }
            }
        )*
    };
}

impl_try_from_optional!(bool, i64, i32, usize, f64, String, HostObject);

impl<T> TryFrom<DynamicValue> for Vec<T>
where
    T: TryFrom<DynamicValue, Error = BridgeError>,
{
    type Error = BridgeError;

    fn try_from(value: DynamicValue) -> Result<Self, Self::Error> {
        match value {
            DynamicValue::Array(items) | DynamicValue::Tuple(items) => {
                items.into_iter().map(T::try_from).collect()
            }
            // 空表在引擎侧无法区分数组与映射
            DynamicValue::Map(map) if map.is_empty() => Ok(Vec::new()),
            other => Err(mismatch("array", &other)),
        }
    }
}

impl<T> TryFrom<DynamicValue> for HashMap<String, T>
where
    T: TryFrom<DynamicValue, Error = BridgeError>,
{
    type Error = BridgeError;

    fn try_from(value: DynamicValue) -> Result<Self, Self::Error> {
        match value {
            DynamicValue::Map(map) => map
                .into_iter()
                .map(|(k, v)| Ok((String::try_from(k)?, T::try_from(v)?)))
                .collect(),
            DynamicValue::Array(items) if items.is_empty() => Ok(HashMap::new()),
            other => Err(mismatch("map", &other)),
        }
    }
}
