use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::*;
use crate::core::error::ErrorKind;
use crate::registry::argument;
use crate::value::{HostObject, ValueMap};

fn bridge() -> ScriptBridge {
    ScriptBridge::new().unwrap()
}

fn add(args: &[DynamicValue]) -> HandlerResult {
    let a: i64 = argument(args, 0)?;
    let b: i64 = argument(args, 1)?;
    Ok(DynamicValue::from(a + b))
}

#[test]
fn test_new_bridge_is_ready() {
    let bridge = bridge();
    assert_eq!(bridge.state(), BridgeState::Ready);
    assert!(bridge.is_ready());
    assert_ne!(bridge.id(), ScriptBridge::new().unwrap().id());
}

#[test]
fn test_invalid_config_rejected() {
    let config = BridgeConfig {
        max_depth: 0,
        ..BridgeConfig::default()
    };
    let err = ScriptBridge::with_config(config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn test_eval_string_success() {
    let bridge = bridge();
    bridge.eval_string("greeting = 'hi' .. ' there'").unwrap();
    assert_eq!(
        bridge.get_global("greeting").unwrap(),
        DynamicValue::from("hi there")
    );
}

#[test]
fn test_compile_error_is_distinct_from_runtime_error() {
    let bridge = bridge();
    let err = bridge.eval_string("this is not valid syntax").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compile);
    assert_eq!(err.line(), Some(1));

    let err = bridge.eval_string("local x = 1\nerror('boom')").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_eq!(err.line(), Some(2));
    assert!(err.to_string().contains("boom"));

    // 出错后桥仍然可用
    assert!(bridge.is_ready());
    bridge.eval_string("ok = true").unwrap();
}

#[test]
fn test_evaluate_returns_chunk_results() {
    let bridge = bridge();
    assert_eq!(bridge.evaluate("x = 1").unwrap(), DynamicValue::Nil);
    assert_eq!(bridge.evaluate("return 7").unwrap(), DynamicValue::Integer(7));
    assert_eq!(
        bridge.evaluate("return 1, 'a', true").unwrap(),
        DynamicValue::tuple([
            DynamicValue::Integer(1),
            DynamicValue::from("a"),
            DynamicValue::Boolean(true),
        ])
    );
}

#[test]
fn test_registered_method_callable_from_script() {
    let mut bridge = bridge();
    bridge.register_method("add", add).unwrap();
    assert!(bridge.has_method("add"));
    assert_eq!(
        bridge.evaluate("return add(2, 3)").unwrap(),
        DynamicValue::Integer(5)
    );
}

#[test]
fn test_duplicate_registration_rejected() {
    let mut bridge = bridge();
    bridge
        .register_method("version", |_: &[DynamicValue]| -> HandlerResult {
            Ok(DynamicValue::from(1i64))
        })
        .unwrap();
    let err = bridge
        .register_method("version", |_: &[DynamicValue]| -> HandlerResult {
            Ok(DynamicValue::from(2i64))
        })
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyRegistered);
    assert_eq!(
        bridge.evaluate("return version()").unwrap(),
        DynamicValue::Integer(1)
    );
}

#[test]
fn test_unregister_then_register_replaces() {
    let mut bridge = bridge();
    bridge.register_method("f", add).unwrap();
    assert!(bridge.unregister_method("f").unwrap());
    assert!(!bridge.unregister_method("f").unwrap());
    assert_eq!(bridge.get_global("f").unwrap(), DynamicValue::Nil);

    bridge
        .register_method("f", |_: &[DynamicValue]| -> HandlerResult {
            Ok(DynamicValue::from("second"))
        })
        .unwrap();
    assert_eq!(bridge.evaluate("return f()").unwrap(), DynamicValue::from("second"));
}

#[test]
fn test_dotted_names_create_tables() {
    let mut bridge = bridge();
    bridge
        .register_method("engine.math.double", |args: &[DynamicValue]| -> HandlerResult {
            let n: i64 = argument(args, 0)?;
            Ok(DynamicValue::from(n * 2))
        })
        .unwrap();
    assert_eq!(
        bridge.evaluate("return engine.math.double(21)").unwrap(),
        DynamicValue::Integer(42)
    );
    assert_eq!(bridge.method_names(), vec!["engine.math.double"]);
}

#[test]
fn test_dotted_name_through_non_table_fails() {
    let mut bridge = bridge();
    bridge.eval_string("engine = 5").unwrap();
    let err = bridge.register_method("engine.log", add).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conversion);
    assert!(!bridge.has_method("engine.log"));
}

#[test]
fn test_call_method_returns_results() {
    let bridge = bridge();
    bridge
        .eval_string("function greet(name) return 'hello ' .. name end")
        .unwrap();
    assert_eq!(
        bridge.call_method("greet", &[DynamicValue::from("lua")]),
        DynamicValue::from("hello lua")
    );
}

#[test]
fn test_call_undefined_method_is_not_found() {
    let bridge = bridge();
    let result = bridge.call_method("undefinedName", &[]);
    assert!(!result.is_nil());
    assert_eq!(result.as_error().unwrap().kind(), ErrorKind::NotFound);

    bridge.eval_string("notAFunction = 3").unwrap();
    let result = bridge.call_method("notAFunction", &[]);
    assert_eq!(result.as_error().unwrap().kind(), ErrorKind::NotFound);
}

#[test]
fn test_script_runtime_error_in_band() {
    let bridge = bridge();
    bridge
        .eval_string("function fail()\n  error('nope')\nend")
        .unwrap();
    let result = bridge.call_method("fail", &[]);
    let err = result.as_error().unwrap();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert_eq!(err.line(), Some(2));
    assert!(bridge.is_ready());
}

#[test]
fn test_failing_handler_leaves_bridge_ready() {
    let mut bridge = bridge();
    bridge
        .register_method("explode", |_: &[DynamicValue]| -> HandlerResult {
            panic!("native fault")
        })
        .unwrap();
    bridge.register_method("add", add).unwrap();
    bridge
        .eval_string("function run() return explode() end")
        .unwrap();

    let result = bridge.call_method("run", &[]);
    let err = result.as_error().unwrap();
    assert_eq!(err.kind(), ErrorKind::Handler);
    assert!(err.message().contains("native fault"));

    assert!(bridge.is_ready());
    assert_eq!(
        bridge.evaluate("return add(1, 1)").unwrap(),
        DynamicValue::Integer(2)
    );
}

#[test]
fn test_handler_error_catchable_by_pcall() {
    let mut bridge = bridge();
    bridge.register_method("add", add).unwrap();
    let caught = bridge
        .evaluate("local ok, err = pcall(add, 'x', 1) return ok, tostring(err)")
        .unwrap();
    let items = caught.as_tuple().unwrap();
    assert_eq!(items[0], DynamicValue::Boolean(false));
    assert!(items[1].as_str().unwrap().contains("bad argument #1"));
}

#[test]
fn test_uncaught_handler_error_keeps_its_kind() {
    let mut bridge = bridge();
    bridge.register_method("add", add).unwrap();
    let err = bridge.eval_string("add('x', 1)").unwrap_err();
    assert!(matches!(err, BridgeError::Handler { ref name, .. } if name == "add"));
}

#[test]
fn test_eval_file_missing_is_io_error() {
    let bridge = bridge();
    let err = bridge.eval_file("/nonexistent/path.lua").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
    assert_ne!(err.kind(), ErrorKind::Compile);
}

#[test]
fn test_eval_file_runs_and_reports_path() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.lua");
    std::fs::write(&good, "loaded = 'yes'").unwrap();
    let bad = dir.path().join("bad.lua");
    std::fs::write(&bad, "\n\nlocal = 3").unwrap();

    let bridge = bridge();
    bridge.eval_file(&good).unwrap();
    assert_eq!(bridge.get_global("loaded").unwrap(), DynamicValue::from("yes"));

    let err = bridge.eval_file(&bad).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Compile);
    assert_eq!(err.line(), Some(3));
    assert!(err.to_string().contains("bad.lua"));
}

#[test]
fn test_eval_file_rejects_non_utf8() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("binary.lua");
    std::fs::write(&path, [0xffu8, 0xfe, 0x00]).unwrap();
    let err = bridge().eval_file(&path).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[test]
fn test_globals_round_trip_structures() {
    let bridge = bridge();
    let mut config = ValueMap::new();
    config.insert("name", "hero");
    config.insert("speed", 2.5);
    config.insert("tags", vec!["a", "b"]);
    let value = DynamicValue::Map(config);

    bridge.set_global("settings.player", &value).unwrap();
    assert_eq!(
        bridge.evaluate("return settings.player.tags[2]").unwrap(),
        DynamicValue::from("b")
    );
    assert_eq!(bridge.get_global("settings.player").unwrap(), value);
    assert_eq!(bridge.get_global("settings.missing.deeper").unwrap(), DynamicValue::Nil);
}

#[test]
fn test_cyclic_script_value_rejected() {
    let bridge = bridge();
    bridge.eval_string("loop = {} loop[1] = loop").unwrap();
    let err = bridge.get_global("loop").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CyclicValue);

    bridge
        .eval_string("function make() local t = {} t.t = t return t end")
        .unwrap();
    let result = bridge.call_method("make", &[]);
    assert_eq!(result.as_error().unwrap().kind(), ErrorKind::CyclicValue);
}

#[test]
fn test_object_identity_through_script() {
    let bridge = bridge();
    bridge
        .eval_string("function identity(x) return x end")
        .unwrap();
    let obj = HostObject::new(String::from("texture"));
    let back = bridge.call_method("identity", &[DynamicValue::Object(obj.clone())]);
    assert!(back.as_object().unwrap().ptr_eq(&obj));
    assert_eq!(
        back.as_object().unwrap().downcast_ref::<String>().unwrap(),
        "texture"
    );
}

#[test]
fn test_data_survives_script_round_trip() {
    let bridge = bridge();
    bridge
        .eval_string("function size(buf) return #buf, buf end")
        .unwrap();
    let payload = DynamicValue::data(vec![0u8, 1, 2, 255]);
    let result = bridge.call_method("size", &[payload.clone()]);
    assert_eq!(
        result,
        DynamicValue::tuple([DynamicValue::Integer(4), payload])
    );
}

#[test]
fn test_script_function_values() {
    let bridge = bridge();
    let func = bridge
        .evaluate("return function(a, b) return a * b end")
        .unwrap();
    let func = func.as_function().unwrap().clone();
    assert!(func.is_script());
    assert_eq!(
        bridge.call_function(&func, &[DynamicValue::Integer(6), DynamicValue::Integer(7)]),
        DynamicValue::Integer(42)
    );

    let other = ScriptBridge::new().unwrap();
    let result = other.call_function(&func, &[]);
    assert_eq!(result.as_error().unwrap().kind(), ErrorKind::Conversion);
}

#[test]
fn test_host_function_value_passed_to_script() {
    let bridge = bridge();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let callback = FunctionRef::host(move |args| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(args.first().cloned().unwrap_or_default())
    });

    bridge
        .eval_string("function apply(f, x) return f(x) end")
        .unwrap();
    let result = bridge.call_method(
        "apply",
        &[DynamicValue::Function(callback.clone()), DynamicValue::Integer(9)],
    );
    assert_eq!(result, DynamicValue::Integer(9));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(
        bridge.call_function(&callback, &[DynamicValue::from("direct")]),
        DynamicValue::from("direct")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_instruction_limit_aborts_runaway_script() {
    let config = BridgeConfig {
        instruction_limit: Some(20_000),
        hook_interval: 100,
        ..BridgeConfig::default()
    };
    let bridge = ScriptBridge::with_config(config).unwrap();
    let err = bridge.eval_string("while true do end").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InstructionLimit);

    // 每次进入都重置预算
    bridge.eval_string("local sum = 0 for i = 1, 10 do sum = sum + i end").unwrap();
}

#[test]
fn test_sandbox_hides_system_libraries() {
    let config = BridgeConfig {
        sandbox: true,
        ..BridgeConfig::default()
    };
    let bridge = ScriptBridge::with_config(config).unwrap();
    assert_eq!(
        bridge
            .evaluate("return io == nil, os == nil, dofile == nil, string ~= nil")
            .unwrap(),
        DynamicValue::tuple([
            DynamicValue::Boolean(true),
            DynamicValue::Boolean(true),
            DynamicValue::Boolean(true),
            DynamicValue::Boolean(true),
        ])
    );
}

#[test]
fn test_captured_print_does_not_fail() {
    let bridge = bridge();
    bridge.eval_string("print('hello', 1, nil, {})").unwrap();
}

#[test]
fn test_closed_bridge_rejects_everything() {
    let mut bridge = bridge();
    bridge.register_method("add", add).unwrap();
    bridge.close();
    bridge.close();

    assert_eq!(bridge.state(), BridgeState::Closed);
    assert_eq!(
        bridge.eval_string("x = 1").unwrap_err().kind(),
        ErrorKind::BridgeClosed
    );
    assert_eq!(
        bridge.eval_file("/nonexistent/path.lua").unwrap_err().kind(),
        ErrorKind::BridgeClosed
    );
    assert_eq!(
        bridge.register_method("sub", add).unwrap_err().kind(),
        ErrorKind::BridgeClosed
    );
    assert_eq!(
        bridge.call_method("add", &[]).as_error().unwrap().kind(),
        ErrorKind::BridgeClosed
    );
    assert!(!bridge.has_method("add"));
    assert!(bridge.method_names().is_empty());
}

#[test]
fn test_eval_string_ignores_unconvertible_results() {
    let bridge = bridge();
    bridge
        .eval_string("side_effect = 42 return coroutine.create(function() end)")
        .unwrap();
    assert_eq!(bridge.get_global("side_effect").unwrap(), DynamicValue::Integer(42));

    bridge
        .eval_string("ran = true local t = {} t.t = t return t")
        .unwrap();
    assert_eq!(bridge.get_global("ran").unwrap(), DynamicValue::Boolean(true));

    // evaluate 仍然转换返回值
    assert_eq!(
        bridge.evaluate("local t = {} t.t = t return t").unwrap_err().kind(),
        ErrorKind::CyclicValue
    );
}

#[test]
fn test_eval_file_ignores_unconvertible_results() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("returns_thread.lua");
    std::fs::write(&path, "loaded = true\nreturn coroutine.create(function() end)\n").unwrap();

    let bridge = bridge();
    bridge.eval_file(&path).unwrap();
    assert_eq!(bridge.get_global("loaded").unwrap(), DynamicValue::Boolean(true));
}

#[test]
fn test_nil_slots_survive_script_round_trip() {
    let bridge = bridge();
    bridge.eval_string("function echo(...) return ... end").unwrap();

    let array = DynamicValue::Array(vec![
        DynamicValue::Integer(1),
        DynamicValue::Nil,
        DynamicValue::Integer(3),
        DynamicValue::Nil,
    ]);
    assert_eq!(bridge.call_method("echo", &[array.clone()]), array);

    let mut map = ValueMap::new();
    map.insert("a", DynamicValue::Nil);
    map.insert("b", 1i64);
    let map = DynamicValue::Map(map);
    assert_eq!(bridge.call_method("echo", &[map.clone()]), map);

    bridge.eval_string("function count(t) return #t end").unwrap();
    assert_eq!(bridge.call_method("count", &[array]), DynamicValue::Integer(4));
}

#[test]
fn test_keys_added_to_array_are_kept() {
    let bridge = bridge();
    bridge
        .eval_string("function label(a) a.label = 'x' return a end")
        .unwrap();
    let result = bridge.call_method("label", &[DynamicValue::from(vec![1i64, 2])]);
    let map = result.as_map().unwrap();
    assert_eq!(map.len(), 3);
    assert_eq!(map.get(&DynamicValue::Integer(1)), Some(&DynamicValue::Integer(1)));
    assert_eq!(map.get(&DynamicValue::Integer(2)), Some(&DynamicValue::Integer(2)));
    assert_eq!(map.get_str("label"), Some(&DynamicValue::from("x")));

    // 只追加元素仍是数组
    bridge
        .eval_string("function push(a) a[#a + 1] = 3 return a end")
        .unwrap();
    assert_eq!(
        bridge.call_method("push", &[DynamicValue::from(vec![1i64, 2])]),
        DynamicValue::from(vec![1i64, 2, 3])
    );
}

#[test]
fn test_data_works_with_string_operations() {
    let bridge = bridge();
    bridge
        .set_global("blob", &DynamicValue::data(b"AB".to_vec()))
        .unwrap();
    assert_eq!(bridge.evaluate("return blob:byte(1)").unwrap(), DynamicValue::Integer(65));
    assert_eq!(bridge.evaluate("return blob:upper()").unwrap(), DynamicValue::from("AB"));
    assert_eq!(
        bridge.evaluate("return blob .. 'C' .. 1").unwrap(),
        DynamicValue::from("ABC1")
    );
    assert_eq!(
        bridge.evaluate("return '>' .. blob").unwrap(),
        DynamicValue::from(">AB")
    );
    assert_eq!(bridge.evaluate("return blob.missing").unwrap(), DynamicValue::Nil);
}
