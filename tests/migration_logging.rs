#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::sync::{Arc, Mutex};

use account_migrate_lib::engine::LocalEngineLauncher;
use account_migrate_lib::{migrate_accounts, MigrationOptions};
use anyhow::Result;
use tracing::Level;
use util::{seed_account_folder, Fixture, ScriptedLauncher};

fn make_writer(buffer: Arc<Mutex<Vec<u8>>>) -> impl for<'w> tracing_subscriber::fmt::MakeWriter<'w> {
    struct BufferWriter {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for BufferWriter {
        type Writer = BufferGuard;

        fn make_writer(&'a self) -> Self::Writer {
            BufferGuard {
                buf: self.buf.clone(),
            }
        }
    }

    struct BufferGuard {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl std::io::Write for BufferGuard {
        fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.buf.lock().expect("buffer poisoned");
            guard.extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    BufferWriter { buf: buffer }
}

fn read_buffer(buffer: &Arc<Mutex<Vec<u8>>>) -> String {
    String::from_utf8(buffer.lock().expect("buffer poisoned").clone()).expect("utf8 logs")
}

#[tokio::test]
async fn successful_run_logs_lifecycle_and_engine_events() -> Result<()> {
    let fx = Fixture::new();
    seed_account_folder(&fx.parent.join("userA"), "a@example.org").await?;

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(Level::TRACE)
        .with_writer(make_writer(buffer.clone()))
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    migrate_accounts(&LocalEngineLauncher, &fx.working, MigrationOptions::default()).await?;

    let logs = read_buffer(&buffer);
    assert!(logs.contains("account_migration"), "logs: {logs}");
    assert!(logs.contains("started"), "logs: {logs}");
    assert!(logs.contains("finished"), "logs: {logs}");
    assert!(logs.contains("engine_event"), "logs: {logs}");
    assert!(logs.contains("accounts_changed"), "logs: {logs}");
    assert!(logs.contains("cleanup_folder"), "logs: {logs}");
    Ok(())
}

#[tokio::test]
async fn failed_account_is_logged_with_its_path() -> Result<()> {
    let fx = Fixture::new();
    let user_b = fx.parent.join("userB");
    seed_account_folder(&user_b, "b@example.org").await?;

    let buffer = Arc::new(Mutex::new(Vec::new()));
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(Level::INFO)
        .with_writer(make_writer(buffer.clone()))
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let launcher = ScriptedLauncher::failing_on("userB");
    migrate_accounts(&launcher, &fx.working, MigrationOptions::default()).await?;

    let logs = read_buffer(&buffer);
    assert!(logs.contains("ERROR"), "logs: {logs}");
    assert!(logs.contains(&user_b.display().to_string()), "logs: {logs}");
    assert!(logs.contains(util::INJECTED_CODE), "logs: {logs}");
    Ok(())
}
