use std::path::Path;

/// Target shared by every event the migration and the local engine emit.
pub const LOG_TARGET: &str = "account_migration";

pub fn display_path<P>(path: P) -> String
where
    P: AsRef<Path>,
{
    path.as_ref().display().to_string()
}

#[macro_export]
macro_rules! migration_log {
    (
        level: $level:ident,
        event: $event:expr,
        outcome: $outcome:expr,
        path = $path:expr
        $(, $field:ident = $value:expr)*
        $(,)?
    ) => {{
        let display_path = $crate::migration::logging::display_path($path);
        ::tracing::$level!(
            target: $crate::migration::logging::LOG_TARGET,
            event = $event,
            outcome = $outcome,
            path = %display_path,
            $($field = $value,)*
        );
    }};
    (
        level: $level:ident,
        event: $event:expr,
        outcome: $outcome:expr
        $(, $field:ident = $value:expr)*
        $(,)?
    ) => {{
        ::tracing::$level!(
            target: $crate::migration::logging::LOG_TARGET,
            event = $event,
            outcome = $outcome,
            $($field = $value,)*
        );
    }};
}
