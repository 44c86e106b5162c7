//! Functions made available to rule expressions.

pub mod cidr;

/// Registers every builtin on the expression engine.
pub fn register(engine: &mut rhai::Engine) {
    engine.register_fn("cidr", cidr::is_ip_in_cidr);
}
