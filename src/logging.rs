//! Helper macros enforcing consistent binding log fields.
//!
//! These macros keep the `connection` field (and optionally `binding`) present on every
//! log emitted from the connection, listener and collector layers so downstream parsing
//! can rely on them.

/// Log an event for a connection/binding pair plus any extra fields.
#[macro_export]
macro_rules! binding_event {
    ($level:ident, $target:expr, $event:expr, connection = $connection:expr, binding = $binding:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            connection = %$connection,
            binding = %$binding,
            $($field = %$value,)*
        )
    };
    ($level:ident, $target:expr, $event:expr, connection = $connection:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            target: $target,
            event = $event,
            connection = %$connection,
            $($field = %$value,)*
        )
    };
}
