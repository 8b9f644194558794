use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{HookTriggers, Lua};

use crate::core::error::{BridgeError, BridgeResult};

/// 指令预算
///
/// 每次宿主进入引擎前重置；计数钩子每触发一次扣除 `interval` 条指令。
#[derive(Debug)]
pub(crate) struct ExecutionBudget {
    limit: u64,
    used: AtomicU64,
}

impl ExecutionBudget {
    pub(crate) fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    pub(crate) fn reset(&self) {
        self.used.store(0, Ordering::Relaxed);
    }

    pub(crate) fn charge(&self, instructions: u64) -> BridgeResult<()> {
        let used = self.used.fetch_add(instructions, Ordering::Relaxed) + instructions;
        if used > self.limit {
            return Err(BridgeError::InstructionLimit(self.limit));
        }
        Ok(())
    }

    pub(crate) fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// 在引擎上安装计数钩子
    pub(crate) fn install(self: &Arc<Self>, lua: &Lua, interval: u32) {
        let budget = Arc::clone(self);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(interval),
            move |_, _| {
                budget
                    .charge(u64::from(interval))
                    .map_err(mlua::Error::external)
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_charge_until_exhausted() {
        let budget = ExecutionBudget::new(250);
        assert!(budget.charge(100).is_ok());
        assert!(budget.charge(100).is_ok());
        assert!(matches!(
            budget.charge(100),
            Err(BridgeError::InstructionLimit(250))
        ));
        budget.reset();
        assert_eq!(budget.used(), 0);
        assert!(budget.charge(100).is_ok());
    }
}
