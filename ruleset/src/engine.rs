//! Construction of the expression engine rules are evaluated with.

use rhai::Scope;

use nt_analyzer::FlowInfo;

use crate::builtins;

/// Upper bound on the operations a single rule evaluation may run.
const MAX_OPERATIONS: u64 = 10_000;

/// Build an expression engine with the builtins registered.
pub fn new_engine() -> rhai::Engine {
    let mut engine = rhai::Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    builtins::register(&mut engine);
    engine
}

/// Build the variables a rule expression can see for a flow.
///
/// * `uid` - the flow id
/// * `proto` - `"tcp"` or `"udp"`
/// * `src_ip`, `dst_ip` - addresses as strings
/// * `src_port`, `dst_port` - ports as integers
pub fn flow_scope(info: &FlowInfo) -> Scope<'static> {
    let mut scope = Scope::new();
    scope.push("uid", info.uid);
    scope.push("proto", info.transport.to_string());
    scope.push("src_ip", info.src_ip.to_string());
    scope.push("dst_ip", info.dst_ip.to_string());
    scope.push("src_port", info.src_port as i64);
    scope.push("dst_port", info.dst_port as i64);
    scope
}
