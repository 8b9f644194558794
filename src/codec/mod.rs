//! 编解码
//!
//! `DynamicValue` 与引擎值之间的双向转换：
//! - 编码（宿主 → 引擎）：数组带共享的标记元表，字节数据与宿主对象使用 userdata，
//!   宿主函数包装成引擎函数；数组元素和映射值中的 Nil 用占位 userdata 保存
//! - 解码（引擎 → 宿主）：带标记的空表或键恰好为 `1..n` 的表解码为数组，其余为映射；
//!   沿当前下降路径检测循环
//!
//! 两个方向都受 `max_depth` 限制。

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::Arc;

use mlua::{AnyUserData, Function, LightUserData, Lua, MultiValue, Table, Value};

use crate::core::error::{BridgeError, BridgeResult};
use crate::registry::{NativeFunction, NativeFunctionRegistry};
use crate::value::{DynamicValue, FunctionRef, OpaquePtr, ScriptFunction};

mod userdata;

pub(crate) use userdata::{DataBuffer, NilSlot, ObjectHandle};

/// 数组标记元表在注册表中的名字
const ARRAY_MARKER: &str = "lua_bridge.array";

/// Nil 占位值在注册表中的名字
const NIL_SLOT: &str = "lua_bridge.nil";

/// 编解码器
///
/// 只携带配置，可随意复制进引擎回调。
#[derive(Debug, Clone, Copy)]
pub struct LuaCodec {
    max_depth: usize,
    bridge_id: u64,
}

impl LuaCodec {
    pub fn new(max_depth: usize, bridge_id: u64) -> Self {
        Self {
            max_depth,
            bridge_id,
        }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn bridge_id(&self) -> u64 {
        self.bridge_id
    }

    /// 在引擎中安装数组标记元表和 Nil 占位值（重复调用无副作用）
    pub fn install(lua: &Lua) -> BridgeResult<()> {
        array_marker(lua)?;
        nil_slot(lua)?;
        Ok(())
    }

    /// 宿主值 → 引擎值
    pub fn to_lua<'lua>(&self, lua: &'lua Lua, value: &DynamicValue) -> BridgeResult<Value<'lua>> {
        let mut session = Session::open(*self, lua)?;
        session.encode(value, 0)
    }

    /// 引擎值 → 宿主值
    pub fn from_lua<'lua>(&self, lua: &'lua Lua, value: Value<'lua>) -> BridgeResult<DynamicValue> {
        let mut session = Session::open(*self, lua)?;
        session.decode(value, 0)
    }

    /// 编码调用参数；顶层的 Tuple 展开为多个值
    pub fn to_lua_multi<'lua>(
        &self,
        lua: &'lua Lua,
        values: &[DynamicValue],
    ) -> BridgeResult<MultiValue<'lua>> {
        let mut session = Session::open(*self, lua)?;
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            match value {
                DynamicValue::Tuple(items) => {
                    for item in items {
                        out.push(session.encode(item, 0)?);
                    }
                }
                other => out.push(session.encode(other, 0)?),
            }
        }
        Ok(MultiValue::from_vec(out))
    }

    /// 编码单个返回值；Tuple 成为多返回值
    pub fn result_to_lua<'lua>(
        &self,
        lua: &'lua Lua,
        value: &DynamicValue,
    ) -> BridgeResult<MultiValue<'lua>> {
        self.to_lua_multi(lua, std::slice::from_ref(value))
    }

    /// 逐个解码多值
    pub fn from_lua_multi<'lua>(
        &self,
        lua: &'lua Lua,
        values: MultiValue<'lua>,
    ) -> BridgeResult<Vec<DynamicValue>> {
        let mut session = Session::open(*self, lua)?;
        values
            .into_vec()
            .into_iter()
            .map(|value| session.decode(value, 0))
            .collect()
    }

    /// 解码返回值：没有返回值为 Nil，一个为其本身，多个为 Tuple
    pub fn results_from_lua<'lua>(
        &self,
        lua: &'lua Lua,
        values: MultiValue<'lua>,
    ) -> BridgeResult<DynamicValue> {
        let mut decoded = self.from_lua_multi(lua, values)?;
        Ok(match decoded.len() {
            0 => DynamicValue::Nil,
            1 => decoded.remove(0),
            _ => DynamicValue::Tuple(decoded),
        })
    }

    /// 把宿主函数包装成引擎函数
    ///
    /// 参数解码、处理函数失败和结果编码中的任何错误都以脚本错误抛出，
    /// 脚本可以用 `pcall` 捕获。
    pub fn trampoline<'lua>(
        &self,
        lua: &'lua Lua,
        name: &str,
        handler: Arc<dyn NativeFunction>,
    ) -> BridgeResult<Function<'lua>> {
        let codec = *self;
        let name = name.to_string();
        let function = lua.create_function(move |lua, args: MultiValue| {
            let args = codec.from_lua_multi(lua, args).map_err(mlua::Error::external)?;
            let result = NativeFunctionRegistry::guarded_call(&name, handler.as_ref(), &args)
                .map_err(mlua::Error::external)?;
            codec
                .result_to_lua(lua, &result)
                .map_err(mlua::Error::external)
        })?;
        Ok(function)
    }
}

/// 取得（必要时创建）数组标记元表
fn array_marker(lua: &Lua) -> mlua::Result<Table<'_>> {
    if let Some(marker) = lua.named_registry_value::<Option<Table>>(ARRAY_MARKER)? {
        return Ok(marker);
    }
    let marker = lua.create_table()?;
    marker.raw_set("__name", "array")?;
    lua.set_named_registry_value(ARRAY_MARKER, marker.clone())?;
    Ok(marker)
}

/// 取得（必要时创建）Nil 占位值
fn nil_slot(lua: &Lua) -> mlua::Result<AnyUserData<'_>> {
    if let Some(slot) = lua.named_registry_value::<Option<AnyUserData>>(NIL_SLOT)? {
        return Ok(slot);
    }
    let slot = lua.create_userdata(NilSlot)?;
    lua.set_named_registry_value(NIL_SLOT, slot.clone())?;
    Ok(slot)
}

/// 一次转换的上下文
struct Session<'lua> {
    codec: LuaCodec,
    lua: &'lua Lua,
    marker: Table<'lua>,
    nil_slot: AnyUserData<'lua>,
    /// 当前下降路径上的表
    path: HashSet<usize>,
}

impl<'lua> Session<'lua> {
    fn open(codec: LuaCodec, lua: &'lua Lua) -> BridgeResult<Self> {
        Ok(Self {
            codec,
            lua,
            marker: array_marker(lua)?,
            nil_slot: nil_slot(lua)?,
            path: HashSet::new(),
        })
    }

    fn check_depth(&self, depth: usize) -> BridgeResult<()> {
        if depth > self.codec.max_depth {
            tracing::debug!(
                target: "script_bridge::codec",
                "Nesting deeper than {} levels",
                self.codec.max_depth
            );
            return Err(BridgeError::DepthExceeded(self.codec.max_depth));
        }
        Ok(())
    }

    fn encode(&mut self, value: &DynamicValue, depth: usize) -> BridgeResult<Value<'lua>> {
        self.check_depth(depth)?;
        let lua = self.lua;
        let encoded = match value {
            DynamicValue::Nil => Value::Nil,
            DynamicValue::Boolean(b) => Value::Boolean(*b),
            DynamicValue::Integer(i) => Value::Integer(*i),
            DynamicValue::Number(n) => Value::Number(*n),
            DynamicValue::String(s) => Value::String(lua.create_string(s)?),
            DynamicValue::Data(bytes) => {
                Value::UserData(lua.create_userdata(DataBuffer(bytes.clone()))?)
            }
            // 嵌套的 Tuple 按数组处理
            DynamicValue::Array(items) | DynamicValue::Tuple(items) => {
                let table = lua.create_table_with_capacity(items.len(), 0)?;
                for (idx, item) in items.iter().enumerate() {
                    table.raw_set(idx + 1, self.encode_slot(item, depth + 1)?)?;
                }
                table.set_metatable(Some(self.marker.clone()));
                Value::Table(table)
            }
            DynamicValue::Map(map) => {
                let table = lua.create_table_with_capacity(0, map.len())?;
                for (key, item) in map.iter() {
                    let key = match self.encode(key, depth + 1)? {
                        Value::Nil => {
                            return Err(BridgeError::Conversion("map key cannot be nil".into()))
                        }
                        Value::Number(n) if n.is_nan() => {
                            return Err(BridgeError::Conversion("map key cannot be NaN".into()))
                        }
                        key => key,
                    };
                    table.raw_set(key, self.encode_slot(item, depth + 1)?)?;
                }
                Value::Table(table)
            }
            DynamicValue::Pointer(ptr) => {
                Value::LightUserData(LightUserData(ptr.addr() as *mut c_void))
            }
            DynamicValue::Object(obj) => {
                Value::UserData(lua.create_userdata(ObjectHandle(obj.clone()))?)
            }
            DynamicValue::Function(FunctionRef::Host(handler)) => {
                Value::Function(self.codec.trampoline(lua, "function", handler.clone())?)
            }
            DynamicValue::Function(FunctionRef::Script(func)) => {
                if func.bridge_id != self.codec.bridge_id {
                    return Err(BridgeError::Conversion(format!(
                        "script function belongs to bridge {} and cannot be used on bridge {}",
                        func.bridge_id, self.codec.bridge_id
                    )));
                }
                Value::Function(lua.registry_value::<Function>(&func.key)?)
            }
            DynamicValue::Error(err) => {
                return Err(BridgeError::Conversion(format!(
                    "error values cannot be passed to scripts ({})",
                    err
                )))
            }
        };
        Ok(encoded)
    }

    /// 编码表中的一个槽位，Nil 换成占位值
    fn encode_slot(&mut self, value: &DynamicValue, depth: usize) -> BridgeResult<Value<'lua>> {
        match value {
            DynamicValue::Nil => Ok(Value::UserData(self.nil_slot.clone())),
            other => self.encode(other, depth),
        }
    }

    fn decode(&mut self, value: Value<'lua>, depth: usize) -> BridgeResult<DynamicValue> {
        self.check_depth(depth)?;
        let decoded = match value {
            Value::Nil => DynamicValue::Nil,
            Value::Boolean(b) => DynamicValue::Boolean(b),
            Value::Integer(i) => DynamicValue::Integer(i),
            Value::Number(n) => DynamicValue::Number(n),
            Value::String(s) => match s.to_str() {
                Ok(text) => DynamicValue::String(text.to_owned()),
                Err(_) => DynamicValue::Data(s.as_bytes().to_vec()),
            },
            Value::LightUserData(ptr) => DynamicValue::Pointer(OpaquePtr::from_addr(ptr.0 as usize)),
            Value::Table(table) => self.decode_table(table, depth)?,
            Value::Function(func) => DynamicValue::Function(FunctionRef::Script(ScriptFunction {
                bridge_id: self.codec.bridge_id,
                key: Arc::new(self.lua.create_registry_value(func)?),
            })),
            Value::UserData(ud) => {
                if ud.is::<NilSlot>() {
                    DynamicValue::Nil
                } else if let Ok(data) = ud.borrow::<DataBuffer>() {
                    DynamicValue::Data(data.0.clone())
                } else if let Ok(obj) = ud.borrow::<ObjectHandle>() {
                    DynamicValue::Object(obj.0.clone())
                } else {
                    tracing::debug!(target: "script_bridge::codec", "Rejected foreign userdata");
                    return Err(BridgeError::Conversion(
                        "foreign userdata cannot be passed to the host".into(),
                    ));
                }
            }
            other => {
                tracing::debug!(
                    target: "script_bridge::codec",
                    "Rejected {} value",
                    other.type_name()
                );
                return Err(BridgeError::Conversion(format!(
                    "{} values cannot be passed to the host",
                    other.type_name()
                )))
            }
        };
        Ok(decoded)
    }

    fn decode_table(&mut self, table: Table<'lua>, depth: usize) -> BridgeResult<DynamicValue> {
        let id = table.to_pointer() as usize;
        if !self.path.insert(id) {
            tracing::debug!(
                target: "script_bridge::codec",
                "Table {:#x} refers back to itself",
                id
            );
            return Err(BridgeError::CyclicValue);
        }
        let result = self.decode_entries(&table, depth);
        self.path.remove(&id);
        result
    }

    fn decode_entries(&mut self, table: &Table<'lua>, depth: usize) -> BridgeResult<DynamicValue> {
        let tagged = table
            .get_metatable()
            .map_or(false, |mt| mt.to_pointer() == self.marker.to_pointer());

        let mut entries = Vec::new();
        for pair in table.clone().pairs::<Value, Value>() {
            entries.push(pair?);
        }

        if tagged && entries.is_empty() {
            return Ok(DynamicValue::Array(Vec::new()));
        }
        if is_sequence(&entries) {
            let mut items = vec![DynamicValue::Nil; entries.len()];
            for (key, item) in entries {
                if let Value::Integer(idx) = key {
                    items[idx as usize - 1] = self.decode(item, depth + 1)?;
                }
            }
            return Ok(DynamicValue::Array(items));
        }
        if tagged {
            // 脚本给数组加了别的键或挖了洞，保留全部条目
            tracing::debug!(
                target: "script_bridge::codec",
                "Array table is no longer a sequence, decoding as map"
            );
        }

        let mut map = crate::value::ValueMap::with_capacity(entries.len());
        for (key, item) in entries {
            let key = self.decode(key, depth + 1)?;
            let item = self.decode(item, depth + 1)?;
            map.insert(key, item);
        }
        Ok(DynamicValue::Map(map))
    }
}

/// 键恰好为 `1..n`（n ≥ 1）
fn is_sequence(entries: &[(Value, Value)]) -> bool {
    let len = entries.len() as i64;
    len > 0
        && entries
            .iter()
            .all(|(key, _)| matches!(key, Value::Integer(idx) if *idx >= 1 && *idx <= len))
}
