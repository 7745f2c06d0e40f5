//! Sandboxed execution context for one script instance.
//!
//! Each context owns a private `rhai` engine with the script-facing host API
//! bound into it. Callbacks a script registers are handed to the host as
//! plain [`Callback`]s that re-enter the engine only while the context is
//! open.

use std::sync::Arc;

use parking_lot::RwLock;
use rhai::module_resolvers::DummyModuleResolver;
use rhai::{CallFnOptions, Dynamic, Engine, FnPtr, Scope, AST, INT};
use serde_json::Value;

use crate::capability::{Registries, ResourceId, TimerSpec};
use crate::config::EngineLimits;
use crate::error::{Error, Result};
use crate::host::{Callback, CommandRequest, CommandSpec, ListenerRequest, Priority};

/// Hook run after a script is enabled.
pub const ON_ENABLE: &str = "onEnable";
/// Hook run before a script is disabled.
pub const ON_DISABLE: &str = "onDisable";

struct Program {
    engine: Arc<Engine>,
    ast: Option<Arc<AST>>,
}

type Slot = Arc<RwLock<Option<Program>>>;

/// One sandboxed evaluator instance.
pub struct ExecutionContext {
    script: Arc<str>,
    slot: Slot,
}

impl ExecutionContext {
    /// Create an engine for `script`, bind the host API backed by
    /// `registries`, and apply `limits`.
    pub fn new(script: &str, limits: &EngineLimits, registries: Registries) -> Self {
        let script: Arc<str> = Arc::from(script);
        let slot: Slot = Arc::new(RwLock::new(None));

        let mut engine = Engine::new();
        sandbox(&mut engine, &script, limits);
        bind_host_api(&mut engine, &script, &slot, registries);

        *slot.write() = Some(Program {
            engine: Arc::new(engine),
            ast: None,
        });

        Self { script, slot }
    }

    /// Name of the owning script.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Compile `source` and run its top-level statements.
    pub fn evaluate(&self, source: &str) -> Result<()> {
        let engine = self.engine()?;

        let ast = engine
            .compile(source)
            .map_err(|e| Error::evaluation(&*self.script, e))?;
        let ast = Arc::new(ast);

        match self.slot.write().as_mut() {
            Some(program) => program.ast = Some(ast.clone()),
            None => return Err(Error::ContextClosed),
        }

        let mut scope = Scope::new();
        engine
            .run_ast_with_scope(&mut scope, &ast)
            .map_err(|e| Error::evaluation(&*self.script, e))
    }

    /// Whether the evaluated program defines a parameterless function `name`.
    pub fn has_hook(&self, name: &str) -> bool {
        let guard = self.slot.read();
        let Some(ast) = guard.as_ref().and_then(|p| p.ast.as_ref()) else {
            return false;
        };
        let found = ast
            .iter_functions()
            .any(|f| f.name == name && f.params.is_empty());
        found
    }

    /// Call hook `name` if it is defined. Returns whether it was.
    pub fn call_hook(&self, name: &'static str) -> Result<bool> {
        if !self.has_hook(name) {
            return Ok(false);
        }

        let (engine, ast) = program(&self.slot)?;
        let options = CallFnOptions::new().eval_ast(false);
        engine
            .call_fn_with_options::<Dynamic>(options, &mut Scope::new(), &ast, name, ())
            .map_err(|e| Error::Hook {
                script: self.script.to_string(),
                hook: name,
                message: e.to_string(),
            })?;
        Ok(true)
    }

    /// Run a script function value with JSON arguments.
    pub fn dispatch(&self, function: &FnPtr, args: &[Value]) -> Result<Value> {
        dispatch(&self.slot, &self.script, function, args)
    }

    /// Whether [`ExecutionContext::close`] has not run yet.
    pub fn is_open(&self) -> bool {
        self.slot.read().is_some()
    }

    /// Release the engine and program. Returns false if already closed.
    pub fn close(&self) -> bool {
        let program = self.slot.write().take();
        if program.is_some() {
            tracing::debug!(script = %self.script, "Closed execution context");
        }
        program.is_some()
    }

    fn engine(&self) -> Result<Arc<Engine>> {
        self.slot
            .read()
            .as_ref()
            .map(|p| p.engine.clone())
            .ok_or(Error::ContextClosed)
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("script", &self.script)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        // Host-held callbacks keep the slot alive; emptying it frees the engine.
        self.close();
    }
}

fn sandbox(engine: &mut Engine, script: &Arc<str>, limits: &EngineLimits) {
    engine.set_module_resolver(DummyModuleResolver::new());
    engine.disable_symbol("eval");

    engine.set_max_operations(limits.max_operations);
    engine.set_max_call_levels(limits.max_call_levels);
    engine.set_max_expr_depths(limits.max_expr_depth, limits.max_expr_depth);
    engine.set_max_string_size(limits.max_string_size);
    engine.set_max_array_size(limits.max_array_size);
    engine.set_max_map_size(limits.max_map_size);

    let name = script.clone();
    engine.on_print(move |s| tracing::info!(script = %name, "{}", s));
    let name = script.clone();
    engine.on_debug(move |s, _src, pos| tracing::debug!(script = %name, "{} @ {}", s, pos));
}

fn program(slot: &Slot) -> Result<(Arc<Engine>, Arc<AST>)> {
    let guard = slot.read();
    let program = guard.as_ref().ok_or(Error::ContextClosed)?;
    let ast = program.ast.clone().ok_or(Error::ContextClosed)?;
    Ok((program.engine.clone(), ast))
}

fn dispatch(slot: &Slot, script: &str, function: &FnPtr, args: &[Value]) -> Result<Value> {
    // Clone out so the slot lock is not held while script code runs.
    let (engine, ast) = program(slot)?;

    let args = args
        .iter()
        .map(rhai::serde::to_dynamic)
        .collect::<std::result::Result<Vec<Dynamic>, _>>()
        .map_err(|e| Error::evaluation(script, e))?;

    let result: Dynamic = function
        .call(&engine, &ast, args)
        .map_err(|e| Error::evaluation(script, e))?;

    if result.is_unit() {
        return Ok(Value::Null);
    }
    rhai::serde::from_dynamic(&result).map_err(|e| Error::evaluation(script, e))
}

fn callback(slot: &Slot, script: &Arc<str>, function: FnPtr) -> Callback {
    let slot = slot.clone();
    let script = script.clone();
    Arc::new(move |args: &[Value]| dispatch(&slot, &script, &function, args))
}

fn function_arg(kind: &'static str, value: Dynamic) -> Result<FnPtr> {
    if value.is_string() {
        let name = value
            .into_string()
            .map_err(|t| Error::invalid_spec(kind, format!("expected function, got {}", t)))?;
        return FnPtr::new(name).map_err(|e| Error::invalid_spec(kind, e.to_string()));
    }
    let type_name = value.type_name();
    value
        .try_cast::<FnPtr>()
        .ok_or_else(|| Error::invalid_spec(kind, format!("expected function, got {}", type_name)))
}

fn millis_arg(kind: &'static str, value: &Dynamic) -> Result<i64> {
    if let Ok(ms) = value.as_int() {
        return Ok(ms);
    }
    if let Ok(ms) = value.as_float() {
        return Ok(ms as i64);
    }
    Err(Error::invalid_spec(
        kind,
        format!("expected a delay in milliseconds, got {}", value.type_name()),
    ))
}

fn command_spec(value: &Dynamic) -> Result<CommandSpec> {
    if value.is_string() {
        let name = value
            .clone()
            .into_string()
            .map_err(|t| Error::invalid_spec("command", format!("expected name, got {}", t)))?;
        return Ok(CommandSpec::named(name));
    }
    if !value.is_map() {
        return Err(Error::invalid_spec(
            "command",
            format!("expected a name or a map, got {}", value.type_name()),
        ));
    }
    rhai::serde::from_dynamic(value).map_err(|e| Error::invalid_spec("command", e.to_string()))
}

fn resource_id(value: &Dynamic) -> Option<ResourceId> {
    value
        .as_int()
        .ok()
        .filter(|id| *id >= 0)
        .map(|id| ResourceId::new(id as u64))
}

/// Script-visible result of a registration: the id, or `()` on failure.
fn registered(script: &str, function: &str, result: Result<ResourceId>) -> Dynamic {
    match result {
        Ok(id) => Dynamic::from(id.raw() as INT),
        Err(e) => {
            // Registries log their own failures; only argument errors are new here.
            if matches!(e, Error::InvalidSpec { .. }) {
                tracing::warn!(script = %script, "{} rejected: {}", function, e);
            }
            Dynamic::UNIT
        }
    }
}

fn bind_host_api(engine: &mut Engine, script: &Arc<str>, slot: &Slot, registries: Registries) {
    // addCommand(spec, executor [, tabCompleter])
    let add_command = {
        let (script, slot, commands) = (script.clone(), slot.clone(), registries.commands.clone());
        move |spec: Dynamic, executor: Dynamic, completer: Option<Dynamic>| -> Dynamic {
            let request = (|| -> Result<CommandRequest> {
                Ok(CommandRequest {
                    spec: command_spec(&spec)?,
                    executor: callback(&slot, &script, function_arg("command", executor)?),
                    tab_completer: match completer {
                        Some(c) => Some(callback(&slot, &script, function_arg("command", c)?)),
                        None => None,
                    },
                })
            })();
            registered(&script, "addCommand", request.and_then(|r| commands.register(r)))
        }
    };
    let f = add_command.clone();
    engine.register_fn("addCommand", move |spec: Dynamic, executor: Dynamic| {
        f(spec, executor, None)
    });
    engine.register_fn(
        "addCommand",
        move |spec: Dynamic, executor: Dynamic, completer: Dynamic| {
            add_command(spec, executor, Some(completer))
        },
    );

    let commands = registries.commands.clone();
    engine.register_fn("removeCommand", move |id: Dynamic| {
        resource_id(&id).map_or(false, |id| commands.unregister(id))
    });

    // addEventListener(eventType, callback [, priority])
    let add_listener = {
        let (script, slot, events) = (script.clone(), slot.clone(), registries.events.clone());
        move |event_type: Dynamic, function: Dynamic, priority: Option<Dynamic>| -> Dynamic {
            let request = (|| -> Result<ListenerRequest> {
                let event_type = event_type.into_string().map_err(|t| {
                    Error::invalid_spec("listener", format!("expected event type, got {}", t))
                })?;
                let priority = match priority {
                    Some(p) => p
                        .into_string()
                        .map_err(|t| {
                            Error::invalid_spec("listener", format!("expected priority, got {}", t))
                        })?
                        .parse::<Priority>()?,
                    None => Priority::default(),
                };
                Ok(ListenerRequest {
                    event_type,
                    callback: callback(&slot, &script, function_arg("listener", function)?),
                    priority,
                })
            })();
            registered(&script, "addEventListener", request.and_then(|r| events.register(r)))
        }
    };
    let f = add_listener.clone();
    engine.register_fn("addEventListener", move |event_type: Dynamic, function: Dynamic| {
        f(event_type, function, None)
    });
    engine.register_fn(
        "addEventListener",
        move |event_type: Dynamic, function: Dynamic, priority: Dynamic| {
            add_listener(event_type, function, Some(priority))
        },
    );

    let events = registries.events.clone();
    engine.register_fn("removeEventListener", move |id: Dynamic| {
        resource_id(&id).map_or(false, |id| events.unregister(id))
    });

    // setInterval / setTimeout (callback, delayMs) -> id
    let add_timer = {
        let (script, slot, timers) = (script.clone(), slot.clone(), registries.timers.clone());
        move |function: Dynamic, delay: Dynamic, repeat: bool, name: &str| -> Dynamic {
            let request = (|| -> Result<TimerSpec> {
                let delay_ms = millis_arg("timer", &delay)?;
                let cb = callback(&slot, &script, function_arg("timer", function)?);
                Ok(if repeat {
                    TimerSpec::interval(cb, delay_ms)
                } else {
                    TimerSpec::timeout(cb, delay_ms)
                })
            })();
            registered(&script, name, request.and_then(|r| timers.register(r)))
        }
    };
    let f = add_timer.clone();
    engine.register_fn("setInterval", move |function: Dynamic, delay: Dynamic| {
        f(function, delay, true, "setInterval")
    });
    engine.register_fn("setTimeout", move |function: Dynamic, delay: Dynamic| {
        add_timer(function, delay, false, "setTimeout")
    });

    for name in ["clearInterval", "clearTimeout"] {
        let timers = registries.timers.clone();
        engine.register_fn(name, move |id: Dynamic| {
            resource_id(&id).map_or(false, |id| timers.unregister(id))
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Registries;
    use crate::host::LocalHost;
    use serde_json::json;
    use std::time::Duration;

    fn context(host: &Arc<LocalHost>) -> (ExecutionContext, Registries) {
        let registries = Registries::new("test.rhai", host.clone());
        let ctx = ExecutionContext::new("test.rhai", &EngineLimits::default(), registries.clone());
        (ctx, registries)
    }

    #[test]
    fn test_evaluate_and_hooks() {
        let host = Arc::new(LocalHost::new());
        let (ctx, _) = context(&host);

        ctx.evaluate("let x = 1 + 2; fn onEnable() { x_was_set() } fn helper(a) { a }")
            .unwrap();
        assert!(ctx.has_hook(ON_ENABLE));
        assert!(!ctx.has_hook(ON_DISABLE));
        assert!(!ctx.has_hook("helper"));

        // Calls an undefined function, so the hook itself fails.
        assert!(matches!(ctx.call_hook(ON_ENABLE), Err(Error::Hook { .. })));
        assert!(!ctx.call_hook(ON_DISABLE).unwrap());
    }

    #[test]
    fn test_evaluation_errors() {
        let host = Arc::new(LocalHost::new());
        let (ctx, _) = context(&host);

        assert!(matches!(ctx.evaluate("let = ;"), Err(Error::Evaluation { .. })));
        assert!(matches!(ctx.evaluate("throw \"boom\";"), Err(Error::Evaluation { .. })));
        assert!(matches!(ctx.evaluate("eval(\"1\")"), Err(Error::Evaluation { .. })));
        assert!(matches!(ctx.evaluate("import \"fs\" as fs;"), Err(Error::Evaluation { .. })));
    }

    #[test]
    fn test_operation_limit() {
        let host = Arc::new(LocalHost::new());
        let registries = Registries::new("spin.rhai", host.clone());
        let limits = EngineLimits::new().with_max_operations(1_000);
        let ctx = ExecutionContext::new("spin.rhai", &limits, registries);

        assert!(ctx.evaluate("loop { }").is_err());
    }

    #[test]
    fn test_timer_and_listener_bindings() {
        let host = Arc::new(LocalHost::new());
        let (ctx, registries) = context(&host);

        ctx.evaluate(
            r#"
            let ticks = [];
            let id = setInterval(|| { ticks.push(1); }, 10);
            setTimeout(|| {}, 5);
            addEventListener("join", |event| event.player, "high");
            if type_of(setTimeout(|| {}, -1)) != "()" { throw "negative delay accepted"; }
            if type_of(addEventListener(42, || {})) != "()" { throw "bad event type accepted"; }
            clearInterval(id);
            clearInterval(id);
            "#,
        )
        .unwrap();

        assert_eq!(registries.timers.len(), 1);
        assert_eq!(registries.events.keys(), vec!["join".to_string()]);
        assert_eq!(host.listener_count("join"), 1);
        assert_eq!(host.fire_event("join", json!({"player": "alex"})), 1);
        assert_eq!(host.advance(Duration::from_millis(5)), 1);
    }

    #[test]
    fn test_command_binding_dispatch() {
        let host = Arc::new(LocalHost::new());
        let (ctx, registries) = context(&host);

        ctx.evaluate(
            r#"
            addCommand(#{ name: "echo", aliases: ["say"], description: "Echo" },
                |sender, label, args| `${sender}:${label}:${args.len()}`,
                |sender, alias, args| ["one", "two"]);
            addCommand("", || true);
            "#,
        )
        .unwrap();

        assert_eq!(registries.commands.keys(), vec!["echo".to_string()]);
        let out = host.dispatch_command("say", json!("console"), &["a", "b"]).unwrap();
        assert_eq!(out, json!("console:say:2"));
        let completions = host.complete_command("echo", json!("console"), &[]).unwrap();
        assert_eq!(completions, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_dispatch_named_function() {
        let host = Arc::new(LocalHost::new());
        let (ctx, _) = context(&host);

        ctx.evaluate("fn double(x) { x * 2 }").unwrap();
        let double = FnPtr::new("double").unwrap();
        assert_eq!(ctx.dispatch(&double, &[json!(21)]).unwrap(), json!(42));
    }

    #[test]
    fn test_closed_context_refuses_dispatch() {
        let host = Arc::new(LocalHost::new());
        let (ctx, registries) = context(&host);

        ctx.evaluate(r#"addEventListener("tick", |e| 1);"#).unwrap();
        assert_eq!(host.fire_event("tick", Value::Null), 1);

        // Close the context but leave the listener in place.
        assert!(ctx.close());
        assert!(!ctx.close());
        assert!(!ctx.is_open());
        assert_eq!(host.fire_event("tick", Value::Null), 0);
        assert!(matches!(ctx.evaluate("1"), Err(Error::ContextClosed)));

        registries.close_all();
        assert_eq!(host.listener_count("tick"), 0);
    }
}
