//! 脚本桥
//!
//! `ScriptBridge` 独占一个 Lua 引擎实例和一份本地函数注册表。
//! 所有操作都是同步的，在调用线程上执行完毕后返回。
//!
//! ## 错误约定
//!
//! - `eval_*`、注册、全局变量读写返回 `BridgeResult`
//! - `call_method` / `call_function` 把错误放进 Error 标签的 `DynamicValue` 中返回
//!
//! ## 状态
//!
//! `Uninitialized -> Ready -> Closed`，关闭后的任何操作都返回 `BridgeClosed`。

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{Function, Lua, LuaOptions, MultiValue, StdLib, Value};

use crate::codec::LuaCodec;
use crate::config::BridgeConfig;
use crate::core::error::{BridgeError, BridgeResult};
use crate::registry::{HandlerResult, NativeFunction, NativeFunctionRegistry};
use crate::value::{DynamicValue, FunctionRef};

mod budget;
mod globals;

#[cfg(test)]
mod tests;

use budget::ExecutionBudget;

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

/// 字符串脚本的块名，错误消息形如 `eval:LINE: ...`
const EVAL_CHUNK: &str = "=eval";

/// 桥状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Ready,
    Closed,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeState::Uninitialized => write!(f, "uninitialized"),
            BridgeState::Ready => write!(f, "ready"),
            BridgeState::Closed => write!(f, "closed"),
        }
    }
}

/// 宿主与 Lua 引擎之间的桥
pub struct ScriptBridge {
    id: u64,
    state: BridgeState,
    config: BridgeConfig,
    codec: LuaCodec,
    lua: Option<Lua>,
    registry: NativeFunctionRegistry,
    budget: Option<Arc<ExecutionBudget>>,
}

impl ScriptBridge {
    /// 使用默认配置创建
    pub fn new() -> BridgeResult<Self> {
        Self::with_config(BridgeConfig::default())
    }

    pub fn with_config(config: BridgeConfig) -> BridgeResult<Self> {
        config.validate()?;
        let id = NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed);
        let mut bridge = Self {
            id,
            state: BridgeState::Uninitialized,
            codec: LuaCodec::new(config.max_depth, id),
            config,
            lua: None,
            registry: NativeFunctionRegistry::new(),
            budget: None,
        };
        bridge.initialize()?;
        Ok(bridge)
    }

    /// 构造引擎实例并进入 Ready
    fn initialize(&mut self) -> BridgeResult<()> {
        let lua = if self.config.sandbox {
            let lua = Lua::new_with(
                StdLib::COROUTINE | StdLib::TABLE | StdLib::STRING | StdLib::UTF8 | StdLib::MATH,
                LuaOptions::new(),
            )?;
            globals::strip_file_access(&lua)?;
            lua
        } else {
            Lua::new()
        };

        LuaCodec::install(&lua)?;
        if self.config.capture_print {
            globals::capture_print(&lua)?;
        }
        if let Some(limit) = self.config.instruction_limit {
            let budget = Arc::new(ExecutionBudget::new(limit));
            budget.install(&lua, self.config.hook_interval);
            self.budget = Some(budget);
        }

        self.lua = Some(lua);
        self.state = BridgeState::Ready;
        tracing::info!(
            target: "script_bridge",
            "Script bridge {} ready (sandbox: {}, instruction limit: {:?})",
            self.id,
            self.config.sandbox,
            self.config.instruction_limit
        );
        Ok(())
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == BridgeState::Ready
    }

    /// 桥的唯一标识，脚本函数句柄只在同一个桥上有效
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn engine(&self) -> BridgeResult<&Lua> {
        match (self.state, &self.lua) {
            (BridgeState::Ready, Some(lua)) => Ok(lua),
            _ => Err(BridgeError::Closed),
        }
    }

    /// 宿主进入引擎前的准备
    fn enter(&self, lua: &Lua) {
        if let Some(budget) = &self.budget {
            budget.reset();
        }
        lua.expire_registry_values();
    }

    /// 编译并执行脚本
    ///
    /// 块的返回值被丢弃，不做转换。
    pub fn eval_string(&self, source: &str) -> BridgeResult<()> {
        self.run_chunk(source, EVAL_CHUNK, |_, _| Ok(()))
    }

    /// 执行脚本并返回块的返回值
    pub fn evaluate(&self, source: &str) -> BridgeResult<DynamicValue> {
        let codec = self.codec;
        self.run_chunk(source, EVAL_CHUNK, move |lua, results| {
            codec.results_from_lua(lua, results)
        })
    }

    /// 读取并执行脚本文件
    ///
    /// 文件缺失、不可读或不是 UTF-8 时返回 `Io`，与脚本错误区分开。
    pub fn eval_file<P: AsRef<Path>>(&self, path: P) -> BridgeResult<()> {
        let path = path.as_ref();
        self.engine()?;
        let source = fs::read_to_string(path).map_err(|err| BridgeError::io(path, err))?;
        tracing::debug!(target: "script_bridge", "Evaluating script file {:?}", path);
        self.run_chunk(&source, &format!("@{}", path.display()), |_, _| Ok(()))
    }

    fn run_chunk<T, F>(&self, source: &str, chunk_name: &str, finish: F) -> BridgeResult<T>
    where
        F: for<'lua> FnOnce(&'lua Lua, MultiValue<'lua>) -> BridgeResult<T>,
    {
        let lua = self.engine()?;
        self.enter(lua);
        let outcome = lua
            .load(source)
            .set_name(chunk_name)
            .into_function()
            .map_err(BridgeError::from)
            .and_then(|function| Ok(function.call::<_, MultiValue>(())?))
            .and_then(|results| finish(lua, results));
        if let Err(err) = &outcome {
            tracing::debug!(target: "script_bridge", "Chunk {} failed: {}", chunk_name, err);
        }
        outcome
    }

    /// 注册本地函数
    pub fn register_method<F>(&mut self, name: &str, handler: F) -> BridgeResult<()>
    where
        F: Fn(&[DynamicValue]) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_handler(name, Arc::new(handler))
    }

    /// 注册本地函数并把跳板函数绑定到全局名字上
    ///
    /// 名字已注册时返回 `AlreadyRegistered`。
    pub fn register_handler(
        &mut self,
        name: &str,
        handler: Arc<dyn NativeFunction>,
    ) -> BridgeResult<()> {
        self.engine()?;
        self.registry.register(name, Arc::clone(&handler))?;

        let bound = self.engine().and_then(|lua| {
            let trampoline = self.codec.trampoline(lua, name, handler)?;
            globals::bind(lua, name, Value::Function(trampoline))
        });
        if let Err(err) = bound {
            self.registry.unregister(name);
            return Err(err);
        }
        tracing::debug!(target: "script_bridge", "Registered native method '{}'", name);
        Ok(())
    }

    /// 注销本地函数并解除全局绑定
    pub fn unregister_method(&mut self, name: &str) -> BridgeResult<bool> {
        self.engine()?;
        if !self.registry.unregister(name) {
            return Ok(false);
        }
        let lua = self.engine()?;
        globals::bind(lua, name, Value::Nil)?;
        Ok(true)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.is_ready() && self.registry.contains(name)
    }

    pub fn method_names(&self) -> Vec<String> {
        self.registry.names()
    }

    /// 调用脚本中定义的全局函数，错误以 Error 标签的值返回
    pub fn call_method(&self, name: &str, args: &[DynamicValue]) -> DynamicValue {
        self.try_call_method(name, args)
            .unwrap_or_else(|err| DynamicValue::from_error(&err))
    }

    pub fn try_call_method(&self, name: &str, args: &[DynamicValue]) -> BridgeResult<DynamicValue> {
        let lua = self.engine()?;
        let function = match globals::lookup(lua, name)? {
            Value::Function(function) => function,
            _ => return Err(BridgeError::NotFound(name.to_string())),
        };
        self.invoke(lua, function, args)
    }

    /// 调用函数值（宿主函数或本桥产生的脚本函数）
    pub fn call_function(&self, function: &FunctionRef, args: &[DynamicValue]) -> DynamicValue {
        self.try_call_function(function, args)
            .unwrap_or_else(|err| DynamicValue::from_error(&err))
    }

    pub fn try_call_function(
        &self,
        function: &FunctionRef,
        args: &[DynamicValue],
    ) -> BridgeResult<DynamicValue> {
        let lua = self.engine()?;
        match function {
            FunctionRef::Host(handler) => {
                NativeFunctionRegistry::guarded_call("function", handler.as_ref(), args)
            }
            FunctionRef::Script(script) => {
                if script.bridge_id() != self.id {
                    return Err(BridgeError::Conversion(format!(
                        "script function belongs to bridge {}, not {}",
                        script.bridge_id(),
                        self.id
                    )));
                }
                let function: Function = lua.registry_value(&script.key)?;
                self.invoke(lua, function, args)
            }
        }
    }

    fn invoke<'lua>(
        &self,
        lua: &'lua Lua,
        function: Function<'lua>,
        args: &[DynamicValue],
    ) -> BridgeResult<DynamicValue> {
        let args = self.codec.to_lua_multi(lua, args)?;
        self.enter(lua);
        let results = function.call::<_, MultiValue>(args)?;
        self.codec.results_from_lua(lua, results)
    }

    /// 把值写入（可带点号的）全局名字
    pub fn set_global(&self, name: &str, value: &DynamicValue) -> BridgeResult<()> {
        let lua = self.engine()?;
        let encoded = self.codec.to_lua(lua, value)?;
        globals::bind(lua, name, encoded)
    }

    /// 读取（可带点号的）全局名字，不存在时为 Nil
    pub fn get_global(&self, name: &str) -> BridgeResult<DynamicValue> {
        let lua = self.engine()?;
        let value = globals::lookup(lua, name)?;
        self.codec.from_lua(lua, value)
    }

    /// 关闭桥，释放引擎与注册表；重复调用无副作用
    pub fn close(&mut self) {
        if self.state == BridgeState::Closed {
            return;
        }
        self.registry.clear();
        self.budget = None;
        self.lua = None;
        self.state = BridgeState::Closed;
        tracing::info!(target: "script_bridge", "Script bridge {} closed", self.id);
    }
}

impl Drop for ScriptBridge {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ScriptBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptBridge")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("methods", &self.registry.names())
            .finish()
    }
}
