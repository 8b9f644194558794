//! 线程安全的脚本桥
//!
//! 引擎实例不能跨线程移动，因此 `ThreadSafeBridge` 在专用线程上持有一个
//! `ScriptBridge`，通过通道转发命令。每条命令自带应答通道，调用方阻塞到
//! 命令执行完毕，所有调用因此被串行化。

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};

use crate::bridge::ScriptBridge;
use crate::config::BridgeConfig;
use crate::core::error::{BridgeError, BridgeResult};
use crate::registry::{HandlerResult, NativeFunction};
use crate::value::{DynamicValue, FunctionRef};

type Reply<T> = Sender<BridgeResult<T>>;

/// 脚本线程命令
enum BridgeCommand {
    Eval {
        source: String,
        reply: Reply<()>,
    },
    Evaluate {
        source: String,
        reply: Reply<DynamicValue>,
    },
    EvalFile {
        path: PathBuf,
        reply: Reply<()>,
    },
    Register {
        name: String,
        handler: Arc<dyn NativeFunction>,
        reply: Reply<()>,
    },
    Unregister {
        name: String,
        reply: Reply<bool>,
    },
    MethodNames {
        reply: Reply<Vec<String>>,
    },
    CallMethod {
        name: String,
        args: Vec<DynamicValue>,
        reply: Reply<DynamicValue>,
    },
    CallFunction {
        function: FunctionRef,
        args: Vec<DynamicValue>,
        reply: Reply<DynamicValue>,
    },
    SetGlobal {
        name: String,
        value: DynamicValue,
        reply: Reply<()>,
    },
    GetGlobal {
        name: String,
        reply: Reply<DynamicValue>,
    },
    /// 关闭脚本线程
    Shutdown,
}

/// 线程安全的脚本桥
pub struct ThreadSafeBridge {
    /// 命令发送器
    command_sender: Sender<BridgeCommand>,
    /// 脚本线程句柄
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
    bridge_id: u64,
}

impl ThreadSafeBridge {
    pub fn new() -> BridgeResult<Self> {
        Self::with_config(BridgeConfig::default())
    }

    /// 启动脚本线程并在其上创建桥
    pub fn with_config(config: BridgeConfig) -> BridgeResult<Self> {
        let (cmd_tx, cmd_rx) = unbounded::<BridgeCommand>();
        let (ready_tx, ready_rx) = bounded::<BridgeResult<u64>>(1);

        let worker = thread::Builder::new()
            .name("lua-bridge".to_string())
            .spawn(move || match ScriptBridge::with_config(config) {
                Ok(bridge) => {
                    let _ = ready_tx.send(Ok(bridge.id()));
                    Self::worker_loop(bridge, cmd_rx);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .map_err(|e| BridgeError::WorkerUnavailable(e.to_string()))?;

        let worker_id = worker.thread().id();
        let bridge_id = match ready_rx.recv() {
            Ok(Ok(id)) => id,
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(BridgeError::WorkerUnavailable(
                    "script thread exited during startup".to_string(),
                ));
            }
        };

        tracing::debug!(target: "script_bridge::worker", "Script thread started for bridge {}", bridge_id);
        Ok(Self {
            command_sender: cmd_tx,
            worker: Some(worker),
            worker_id,
            bridge_id,
        })
    }

    /// 脚本线程主循环
    fn worker_loop(mut bridge: ScriptBridge, cmd_rx: Receiver<BridgeCommand>) {
        while let Ok(cmd) = cmd_rx.recv() {
            match cmd {
                BridgeCommand::Eval { source, reply } => {
                    let _ = reply.send(bridge.eval_string(&source));
                }
                BridgeCommand::Evaluate { source, reply } => {
                    let _ = reply.send(bridge.evaluate(&source));
                }
                BridgeCommand::EvalFile { path, reply } => {
                    let _ = reply.send(bridge.eval_file(&path));
                }
                BridgeCommand::Register {
                    name,
                    handler,
                    reply,
                } => {
                    let _ = reply.send(bridge.register_handler(&name, handler));
                }
                BridgeCommand::Unregister { name, reply } => {
                    let _ = reply.send(bridge.unregister_method(&name));
                }
                BridgeCommand::MethodNames { reply } => {
                    let _ = reply.send(Ok(bridge.method_names()));
                }
                BridgeCommand::CallMethod { name, args, reply } => {
                    let _ = reply.send(Ok(bridge.call_method(&name, &args)));
                }
                BridgeCommand::CallFunction {
                    function,
                    args,
                    reply,
                } => {
                    let _ = reply.send(Ok(bridge.call_function(&function, &args)));
                }
                BridgeCommand::SetGlobal { name, value, reply } => {
                    let _ = reply.send(bridge.set_global(&name, &value));
                }
                BridgeCommand::GetGlobal { name, reply } => {
                    let _ = reply.send(bridge.get_global(&name));
                }
                BridgeCommand::Shutdown => break,
            }
        }
        bridge.close();
        tracing::debug!(target: "script_bridge::worker", "Script thread for bridge {} stopped", bridge.id());
    }

    /// 发送命令并等待应答
    fn request<T>(&self, build: impl FnOnce(Reply<T>) -> BridgeCommand) -> BridgeResult<T> {
        if thread::current().id() == self.worker_id {
            return Err(BridgeError::Reentrant);
        }
        let (reply_tx, reply_rx) = bounded(1);
        self.command_sender
            .send(build(reply_tx))
            .map_err(|e| BridgeError::WorkerUnavailable(format!("failed to send command: {}", e)))?;
        reply_rx
            .recv()
            .map_err(|e| BridgeError::WorkerUnavailable(format!("no reply from script thread: {}", e)))?
    }

    /// 底层桥的标识
    pub fn id(&self) -> u64 {
        self.bridge_id
    }

    pub fn eval_string(&self, source: &str) -> BridgeResult<()> {
        let source = source.to_string();
        self.request(|reply| BridgeCommand::Eval { source, reply })
    }

    pub fn evaluate(&self, source: &str) -> BridgeResult<DynamicValue> {
        let source = source.to_string();
        self.request(|reply| BridgeCommand::Evaluate { source, reply })
    }

    pub fn eval_file(&self, path: impl Into<PathBuf>) -> BridgeResult<()> {
        let path = path.into();
        self.request(|reply| BridgeCommand::EvalFile { path, reply })
    }

    pub fn register_method<F>(&self, name: &str, handler: F) -> BridgeResult<()>
    where
        F: Fn(&[DynamicValue]) -> HandlerResult + Send + Sync + 'static,
    {
        self.register_handler(name, Arc::new(handler))
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn NativeFunction>) -> BridgeResult<()> {
        let name = name.to_string();
        self.request(|reply| BridgeCommand::Register {
            name,
            handler,
            reply,
        })
    }

    pub fn unregister_method(&self, name: &str) -> BridgeResult<bool> {
        let name = name.to_string();
        self.request(|reply| BridgeCommand::Unregister { name, reply })
    }

    pub fn method_names(&self) -> BridgeResult<Vec<String>> {
        self.request(|reply| BridgeCommand::MethodNames { reply })
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.method_names()
            .map(|names| names.iter().any(|n| n == name))
            .unwrap_or(false)
    }

    /// 调用脚本函数，错误以 Error 标签的值返回
    pub fn call_method(&self, name: &str, args: &[DynamicValue]) -> DynamicValue {
        let name = name.to_string();
        let args = args.to_vec();
        self.request(|reply| BridgeCommand::CallMethod { name, args, reply })
            .unwrap_or_else(|err| DynamicValue::from_error(&err))
    }

    pub fn call_function(&self, function: &FunctionRef, args: &[DynamicValue]) -> DynamicValue {
        let function = function.clone();
        let args = args.to_vec();
        self.request(|reply| BridgeCommand::CallFunction {
            function,
            args,
            reply,
        })
        .unwrap_or_else(|err| DynamicValue::from_error(&err))
    }

    pub fn set_global(&self, name: &str, value: &DynamicValue) -> BridgeResult<()> {
        let name = name.to_string();
        let value = value.clone();
        self.request(|reply| BridgeCommand::SetGlobal { name, value, reply })
    }

    pub fn get_global(&self, name: &str) -> BridgeResult<DynamicValue> {
        let name = name.to_string();
        self.request(|reply| BridgeCommand::GetGlobal { name, reply })
    }

    /// 关闭桥并等待脚本线程退出
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = self.command_sender.send(BridgeCommand::Shutdown);
            if thread::current().id() != self.worker_id {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ThreadSafeBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
