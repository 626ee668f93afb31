//! 脚本引擎单元测试

use std::sync::Arc;

use crate::debug::DebugPortAllocator;
use crate::engine::{EngineError, EngineInstance, ScriptError};
use crate::host::{DispatchTable, HostServices, MemoryResourceLoader};
use crate::util::config::{ConfigError, HostConfig};

const BOOTSTRAP: &str = r#"
let greeting = "hello";

fn explode(message) {
    throw message;
}

fn run_callback(descriptor) {
    if type_of(descriptor) != "map" {
        return descriptor;
    }
    switch descriptor.func {
        "echo" => descriptor.args[0],
        "number" => 42,
        "load" => {
            load(descriptor.args[0]);
            "loaded"
        }
        "invoke" => {
            let result = invoke(descriptor.args[0], descriptor.args[1]);
            if type_of(result) == "()" { "null" } else { result }
        }
        "invoke_bare" => {
            let result = invoke(descriptor.args[0]);
            if type_of(result) == "()" { "null" } else { result }
        }
        "invoke_map" => invoke(descriptor.args[0], #{ id: 7, tags: ["a", "b"] }),
        "invoke_int" => invoke(descriptor.args[0], 7),
        "invoke_blob" => invoke(descriptor.args[0], blob(2, 0xff)),
        "setup_answer" => setup_answer(),
        "import" => {
            import "lib/math.rhai" as math;
            `${math::double(21)}`
        }
        "nested" => explode("boom"),
        "closure" => {
            let f = |x| explode(x);
            f.call("from closure")
        }
        _ => ()
    }
}
"#;

fn loader() -> MemoryResourceLoader {
    MemoryResourceLoader::new()
        .with(
            "lib/setup.rhai",
            "invoke(\"record\", \"setup ran\");\nfn setup_answer() { \"from setup\" }",
        )
        .with("lib/helpers.rhai", "fn helper() { \"helped\" }\nfn setup_answer() { \"from helpers\" }")
        .with("lib/broken.rhai", "let y = 1;\nthrow \"bad script\";")
        .with("lib/math.rhai", "fn double(x) { x * 2 }")
        .with("lib/recursive.rhai", "load(\"lib/recursive.rhai\");")
        .with("empty.rhai", "")
}

fn services_with(
    table: Arc<DispatchTable>,
    config: HostConfig,
) -> HostServices {
    HostServices::new(Arc::new(loader()), table, config).with_ports(Arc::new(DebugPortAllocator::new()))
}

fn engine_with(table: Arc<DispatchTable>) -> EngineInstance {
    EngineInstance::new(BOOTSTRAP.as_bytes(), &services_with(table, HostConfig::default())).unwrap()
}

fn engine() -> EngineInstance {
    engine_with(Arc::new(DispatchTable::new()))
}

fn run(
    engine: &EngineInstance,
    descriptor: &str,
) -> Result<Option<String>, ScriptError> {
    engine
        .run_callback(descriptor.as_bytes())
        .map(|out| out.map(|bytes| String::from_utf8(bytes).unwrap()))
}

#[cfg(test)]
mod construction_tests {
    use super::*;

    #[test]
    fn test_engine_without_debug_port() {
        let engine = engine();
        assert_eq!(engine.port(), 0);
        assert!(!engine.is_debugger_attached());
        assert_eq!(engine.module_count(), 0);
    }

    #[test]
    fn test_bootstrap_error_aborts_construction() {
        let services = services_with(Arc::new(DispatchTable::new()), HostConfig::default());
        match EngineInstance::new(b"throw \"no bootstrap\";", &services) {
            Err(EngineError::Bootstrap(err)) => assert!(err.trace.contains("no bootstrap")),
            other => panic!("expected bootstrap error, got {other:?}"),
        }
    }

    #[test]
    fn test_bootstrap_syntax_error() {
        let services = services_with(Arc::new(DispatchTable::new()), HostConfig::default());
        let result = EngineInstance::new(b"fn run_callback(", &services);
        assert!(matches!(result, Err(EngineError::Bootstrap(_))));
    }

    #[test]
    fn test_bootstrap_must_be_utf8() {
        let services = services_with(Arc::new(DispatchTable::new()), HostConfig::default());
        let result = EngineInstance::new(&[0xff, 0xfe, 0x00], &services);
        assert!(matches!(result, Err(EngineError::Bootstrap(_))));
    }

    #[test]
    fn test_invalid_debug_port_is_config_error() {
        let mut config = HostConfig::default();
        config.debug_connection_port = "debug".to_string();
        let services = services_with(Arc::new(DispatchTable::new()), config);
        match EngineInstance::new(BOOTSTRAP.as_bytes(), &services) {
            Err(EngineError::Config(ConfigError::InvalidPort { value })) => {
                assert_eq!(value, "debug")
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_debug_port_disables_debugging() {
        let config = HostConfig::default().with_debug_port(0);
        let ports = Arc::new(DebugPortAllocator::new());
        let services = services_with(Arc::new(DispatchTable::new()), config).with_ports(ports.clone());
        let engine = EngineInstance::new(BOOTSTRAP.as_bytes(), &services).unwrap();
        assert_eq!(engine.port(), 0);
        assert_eq!(ports.issued(), 0);
    }

    #[test]
    fn test_bootstrap_calls_host_during_construction() {
        let table = Arc::new(DispatchTable::new());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        table.register("init", move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(None)
        });
        let code = format!("invoke(\"init\");\n{BOOTSTRAP}");
        let services = services_with(table, HostConfig::default());
        EngineInstance::new(code.as_bytes(), &services).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}

#[cfg(test)]
mod run_callback_tests {
    use super::*;

    #[test]
    fn test_string_result_is_returned() {
        let engine = engine();
        let out = run(&engine, r#"{"module":"m","func":"echo","args":["hi there"]}"#).unwrap();
        assert_eq!(out.as_deref(), Some("hi there"));
    }

    #[test]
    fn test_non_string_result_is_none() {
        let engine = engine();
        assert_eq!(run(&engine, r#"{"func":"number"}"#).unwrap(), None);
        assert_eq!(run(&engine, r#"{"module":"m","func":"f","args":[]}"#).unwrap(), None);
    }

    #[test]
    fn test_non_json_descriptor_is_passed_as_string() {
        let engine = engine();
        assert_eq!(run(&engine, "not json").unwrap().as_deref(), Some("not json"));
        // a JSON string arrives as a plain string too
        assert_eq!(run(&engine, r#""quoted""#).unwrap().as_deref(), Some("quoted"));
    }

    #[test]
    fn test_engine_is_reusable_after_error() {
        let engine = engine();
        assert!(run(&engine, r#"{"func":"nested"}"#).is_err());
        let out = run(&engine, r#"{"func":"echo","args":["again"]}"#).unwrap();
        assert_eq!(out.as_deref(), Some("again"));
    }

    #[test]
    fn test_missing_entry_point() {
        let services = services_with(Arc::new(DispatchTable::new()), HostConfig::default());
        let engine = EngineInstance::new(b"let x = 1;", &services).unwrap();
        let err = engine.run_callback(b"{}").unwrap_err();
        assert!(err.trace.contains("run_callback"), "{}", err.trace);
    }

    #[test]
    fn test_reentrant_run_is_rejected() {
        let table = Arc::new(DispatchTable::new());
        let cell: Arc<once_cell::sync::OnceCell<Arc<EngineInstance>>> = Arc::new(once_cell::sync::OnceCell::new());
        let inner = cell.clone();
        table.register("reenter", move |_| {
            let engine = inner.get().ok_or("engine not ready")?;
            engine
                .run_callback(br#"{"func":"number"}"#)
                .map(|_| None)
                .map_err(|err| err.trace)
        });
        let engine = Arc::new(engine_with(table));
        cell.set(engine.clone()).unwrap();

        let err = run(&engine, r#"{"func":"invoke_bare","args":["reenter"]}"#).unwrap_err();
        assert!(err.trace.contains("engine is busy"), "{}", err.trace);
        // the outer run released the engine
        assert!(run(&engine, r#"{"func":"number"}"#).is_ok());
    }

    #[test]
    fn test_host_panic_becomes_script_error() {
        let table = Arc::new(DispatchTable::new());
        table.register("crash", |_| panic!("host call crashed"));
        let engine = engine_with(table);

        let err = run(&engine, r#"{"func":"invoke_bare","args":["crash"]}"#).unwrap_err();
        assert!(err.trace.contains("fatal interpreter error"));
        assert!(err.trace.contains("host call crashed"));
        assert!(run(&engine, r#"{"func":"number"}"#).is_ok());
    }
}

#[cfg(test)]
mod bridge_tests {
    use super::*;

    fn recording_table() -> (Arc<DispatchTable>, Arc<parking_lot::Mutex<Vec<String>>>) {
        let table = Arc::new(DispatchTable::new());
        let records = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = records.clone();
        table.register("record", move |input| {
            sink.lock().push(String::from_utf8_lossy(input).into_owned());
            Ok(None)
        });
        (table, records)
    }

    #[test]
    fn test_load_runs_script() {
        let (table, records) = recording_table();
        let engine = engine_with(table);
        let out = run(&engine, r#"{"func":"load","args":["lib/setup.rhai"]}"#).unwrap();
        assert_eq!(out.as_deref(), Some("loaded"));
        assert_eq!(*records.lock(), vec!["setup ran".to_string()]);
    }

    #[test]
    fn test_loaded_functions_outlive_the_load() {
        let (table, _records) = recording_table();
        let engine = engine_with(table);
        assert!(run(&engine, r#"{"func":"setup_answer"}"#).is_err());

        run(&engine, r#"{"func":"load","args":["lib/setup.rhai"]}"#).unwrap();
        let out = run(&engine, r#"{"func":"setup_answer"}"#).unwrap();
        assert_eq!(out.as_deref(), Some("from setup"));

        // a later definition replaces the earlier one
        run(&engine, r#"{"func":"load","args":["lib/helpers.rhai"]}"#).unwrap();
        let out = run(&engine, r#"{"func":"setup_answer"}"#).unwrap();
        assert_eq!(out.as_deref(), Some("from helpers"));
    }

    #[test]
    fn test_bootstrap_load_provides_library_functions() {
        let services = services_with(Arc::new(DispatchTable::new()), HostConfig::default());
        let code = "load(\"lib/helpers.rhai\");\nfn run_callback(descriptor) { helper() }";
        let engine = EngineInstance::new(code.as_bytes(), &services).unwrap();
        assert_eq!(run(&engine, "{}").unwrap().as_deref(), Some("helped"));
        // gc only drops imported modules
        engine.collect_garbage();
        assert_eq!(run(&engine, "{}").unwrap().as_deref(), Some("helped"));
    }

    #[test]
    fn test_load_missing_path_mentions_path() {
        let engine = engine();
        let err = run(&engine, r#"{"func":"load","args":["missing/path.js"]}"#).unwrap_err();
        assert!(err.trace.contains("missing/path.js"), "{}", err.trace);
    }

    #[test]
    fn test_load_empty_script_fails() {
        let engine = engine();
        let err = run(&engine, r#"{"func":"load","args":["empty.rhai"]}"#).unwrap_err();
        assert!(err.trace.contains("empty script content: [empty.rhai]"), "{}", err.trace);
    }

    #[test]
    fn test_load_script_error_is_tagged_with_path() {
        let engine = engine();
        let err = run(&engine, r#"{"func":"load","args":["lib/broken.rhai"]}"#).unwrap_err();
        assert!(err.trace.contains("bad script"), "{}", err.trace);
        assert!(err.trace.contains("lib/broken.rhai"), "{}", err.trace);
    }

    #[test]
    fn test_runaway_load_recursion_is_stopped() {
        // deep interpreter recursion needs more than the default test stack
        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024 * 1024)
            .spawn(|| {
                let engine = engine();
                run(&engine, r#"{"func":"load","args":["lib/recursive.rhai"]}"#).unwrap_err()
            })
            .unwrap();
        let err = handle.join().unwrap();
        assert!(err.trace.contains("load nested deeper than"), "{}", err.trace);
    }

    #[test]
    fn test_invoke_returns_output() {
        let table = Arc::new(DispatchTable::new());
        table.register("upper", |input| {
            Ok(Some(String::from_utf8_lossy(input).to_uppercase().into_bytes()))
        });
        let engine = engine_with(table);
        let out = run(&engine, r#"{"func":"invoke","args":["upper","abc"]}"#).unwrap();
        assert_eq!(out.as_deref(), Some("ABC"));
    }

    #[test]
    fn test_invoke_binary_output_is_kept() {
        let table = Arc::new(DispatchTable::new());
        table.register("raw", |_| Ok(Some(vec![0xff, 0xfe, 0x41])));
        table.register("length", |input| Ok(Some(input.len().to_string().into_bytes())));
        let engine = engine_with(table);

        let out = engine
            .run_callback(br#"{"func":"invoke_bare","args":["raw"]}"#)
            .unwrap();
        assert_eq!(out, Some(vec![0xff, 0xfe, 0x41]));

        let out = run(&engine, r#"{"func":"invoke_blob","args":["length"]}"#).unwrap();
        assert_eq!(out.as_deref(), Some("2"));
    }

    #[test]
    fn test_invoke_encodes_structured_input_as_json() {
        let table = Arc::new(DispatchTable::new());
        table.register("echo", |input| Ok(Some(input.to_vec())));
        let engine = engine_with(table);

        let out = run(&engine, r#"{"func":"invoke_map","args":["echo"]}"#).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value, serde_json::json!({ "id": 7, "tags": ["a", "b"] }));

        let out = run(&engine, r#"{"func":"invoke_int","args":["echo"]}"#).unwrap();
        assert_eq!(out.as_deref(), Some("7"));
    }

    #[test]
    fn test_invoke_without_output_is_null() {
        let table = Arc::new(DispatchTable::new());
        table.register("none", |_| Ok(None));
        table.register("empty", |_| Ok(Some(Vec::new())));
        let engine = engine_with(table);

        let out = run(&engine, r#"{"func":"invoke","args":["none","{}"]}"#).unwrap();
        assert_eq!(out.as_deref(), Some("null"));
        let out = run(&engine, r#"{"func":"invoke","args":["empty","{}"]}"#).unwrap();
        assert_eq!(out.as_deref(), Some("null"));
    }

    #[test]
    fn test_invoke_error_text_propagates() {
        let table = Arc::new(DispatchTable::new());
        table.register("fail", |_| Err("dispatcher said no".to_string()));
        let engine = engine_with(table);

        let err = run(&engine, r#"{"func":"invoke","args":["fail","{}"]}"#).unwrap_err();
        assert!(err.trace.contains("dispatcher said no"), "{}", err.trace);
        assert!(err.trace.contains("'invoke' error for name: [fail]"), "{}", err.trace);
    }

    #[test]
    fn test_invoke_unknown_call() {
        let engine = engine();
        let err = run(&engine, r#"{"func":"invoke_bare","args":["nope"]}"#).unwrap_err();
        assert!(err.trace.contains("no host call registered for name: [nope]"), "{}", err.trace);
    }

    #[test]
    fn test_import_through_loader_and_gc() {
        let engine = engine();
        let out = run(&engine, r#"{"func":"import"}"#).unwrap();
        assert_eq!(out.as_deref(), Some("42"));
        assert_eq!(engine.module_count(), 1);

        // cached on the second import
        run(&engine, r#"{"func":"import"}"#).unwrap();
        assert_eq!(engine.module_count(), 1);

        assert_eq!(engine.collect_garbage(), 1);
        assert_eq!(engine.module_count(), 0);
        assert_eq!(engine.collect_garbage(), 0);

        let out = run(&engine, r#"{"func":"import"}"#).unwrap();
        assert_eq!(out.as_deref(), Some("42"));
    }
}

#[cfg(test)]
mod trace_tests {
    use super::*;

    #[test]
    fn test_trace_lists_script_frames() {
        let engine = engine();
        let err = run(&engine, r#"{"func":"nested"}"#).unwrap_err();
        let mut lines = err.trace.lines();
        assert_eq!(lines.next(), Some("boom"));
        assert!(err.trace.contains("at explode ("), "{}", err.trace);
    }

    #[test]
    fn test_trace_hides_entry_point_and_closures() {
        let engine = engine();
        let err = run(&engine, r#"{"func":"closure"}"#).unwrap_err();
        assert!(err.trace.starts_with("from closure"), "{}", err.trace);
        assert!(err.trace.contains("at explode ("), "{}", err.trace);
        assert!(!err.trace.contains("at run_callback"), "{}", err.trace);
        assert!(!err.trace.contains("anon$"), "{}", err.trace);
    }

    #[test]
    fn test_format_plain_runtime_error() {
        let err = rhai::EvalAltResult::ErrorRuntime("plain".into(), rhai::Position::NONE);
        assert_eq!(crate::engine::format_stacktrace(&err), "plain");
    }
}

#[cfg(test)]
mod debugger_tests {
    use super::*;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::time::{Duration, Instant};

    fn connect_with_retry(port: u16) -> TcpStream {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return stream,
                Err(err) if Instant::now() > deadline => panic!("debugger never listened: {err}"),
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    #[test]
    fn test_engine_waits_for_debugger() {
        let base = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let ports = Arc::new(DebugPortAllocator::new());
        let config = HostConfig::default().with_debug_port(base);
        let services = services_with(Arc::new(DispatchTable::new()), config).with_ports(ports.clone());

        let builder = std::thread::spawn(move || EngineInstance::new(BOOTSTRAP.as_bytes(), &services));
        let mut client = connect_with_retry(base);
        let engine = builder.join().unwrap().unwrap();

        assert_eq!(engine.port(), base);
        assert_eq!(ports.issued(), 1);
        assert!(engine.is_debugger_attached());

        // an idle debugger does not get in the way
        let out = run(&engine, r#"{"func":"echo","args":["traced"]}"#).unwrap();
        assert_eq!(out.as_deref(), Some("traced"));

        drop(engine);
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut received = String::new();
        client.read_to_string(&mut received).unwrap();
        assert!(received.starts_with("attached\n"), "{received}");
        assert!(received.ends_with("detached\n"), "{received}");
    }

    #[test]
    fn test_finished_is_sent_once_per_run() {
        let base = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let table = Arc::new(DispatchTable::new());
        table.register("record", |_| Ok(None));
        let config = HostConfig::default().with_debug_port(base);
        let services = services_with(table, config);

        let builder = std::thread::spawn(move || EngineInstance::new(BOOTSTRAP.as_bytes(), &services));
        let mut client = connect_with_retry(base);
        let engine = builder.join().unwrap().unwrap();

        // both a load and an import evaluate a script inside the run
        run(&engine, r#"{"func":"load","args":["lib/setup.rhai"]}"#).unwrap();
        run(&engine, r#"{"func":"import"}"#).unwrap();

        drop(engine);
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut received = String::new();
        client.read_to_string(&mut received).unwrap();
        assert_eq!(received, "attached\nfinished\nfinished\ndetached\n");
    }
}
