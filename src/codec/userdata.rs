//! 跨边界的 userdata 类型

use mlua::{AnyUserData, Function, MetaMethod, MultiValue, Table, UserData, UserDataMethods, Value};

use crate::value::HostObject;

/// 数组元素或映射值为 Nil 时的占位值
///
/// 引擎中的 nil 无法存放在表里，编码时用这个单例代替，解码时还原为 Nil。
pub(crate) struct NilSlot;

impl UserData for NilSlot {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, _, ()| Ok("nil"));
    }
}

/// 字节数据在引擎中的形态
///
/// `#buf` 返回字节数，`tostring(buf)` 返回原始字节串，`==` 按内容比较，
/// `..` 与字符串和数字拼接成字符串。`buf:byte(1)` 这类方法调用转发给 `string` 库，
/// 直接调用 `string.byte(buf)` 仍需先 `tostring`。
pub(crate) struct DataBuffer(pub(crate) Vec<u8>);

impl UserData for DataBuffer {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Len, |_, this, ()| Ok(this.0.len()));
        methods.add_meta_method(MetaMethod::ToString, |lua, this, ()| {
            lua.create_string(&this.0)
        });
        methods.add_meta_function(MetaMethod::Concat, |lua, (lhs, rhs): (Value, Value)| {
            let mut bytes = concat_operand(&lhs)?;
            bytes.extend(concat_operand(&rhs)?);
            lua.create_string(&bytes)
        });
        methods.add_meta_method(MetaMethod::Index, |lua, _, key: String| {
            let Some(string_lib) = lua.globals().raw_get::<_, Option<Table>>("string")? else {
                return Ok(Value::Nil);
            };
            if !matches!(string_lib.raw_get::<_, Value>(key.as_str())?, Value::Function(_)) {
                return Ok(Value::Nil);
            }
            let forward = lua.create_function(move |lua, (this, rest): (AnyUserData, MultiValue)| {
                let bytes = lua.create_string(&this.borrow::<DataBuffer>()?.0)?;
                let string_lib: Table = lua.globals().raw_get("string")?;
                let function: Function = string_lib.raw_get(key.as_str())?;
                let mut args = rest.into_vec();
                args.insert(0, Value::String(bytes));
                function.call::<_, MultiValue>(MultiValue::from_vec(args))
            })?;
            Ok(Value::Function(forward))
        });
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            Ok(other
                .borrow::<DataBuffer>()
                .map(|other| other.0 == this.0)
                .unwrap_or(false))
        });
    }
}

/// 宿主对象在引擎中的形态，持有同一个 `Arc`
pub(crate) struct ObjectHandle(pub(crate) HostObject);

impl UserData for ObjectHandle {
    fn add_methods<'lua, M: UserDataMethods<'lua, Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("object: {:#x}", this.0.addr()))
        });
        methods.add_meta_method(MetaMethod::Eq, |_, this, other: AnyUserData| {
            Ok(other
                .borrow::<ObjectHandle>()
                .map(|other| other.0.ptr_eq(&this.0))
                .unwrap_or(false))
        });
    }
}

/// `..` 的一侧转成字节
fn concat_operand(value: &Value) -> mlua::Result<Vec<u8>> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Integer(i) => Ok(i.to_string().into_bytes()),
        Value::Number(n) => Ok(n.to_string().into_bytes()),
        Value::UserData(ud) => match ud.borrow::<DataBuffer>() {
            Ok(data) => Ok(data.0.clone()),
            Err(_) => Err(mlua::Error::RuntimeError(
                "attempt to concatenate a userdata value".into(),
            )),
        },
        other => Err(mlua::Error::RuntimeError(format!(
            "attempt to concatenate a {} value",
            other.type_name()
        ))),
    }
}
