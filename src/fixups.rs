//! Account config corrections applied after migration, on every start.

use crate::engine::{AccountEngine, AccountId};
use crate::migration::logging::LOG_TARGET;
use crate::AppResult;

pub const KEY_IS_CHATMAIL: &str = "is_chatmail";
pub const KEY_DELETE_SERVER_AFTER: &str = "delete_server_after";

/// Chatmail servers delete messages on their own; a client-side
/// delete-from-server timer on such an account is cleared.
///
/// Failures are logged per account and never propagated. Returns the ids of
/// the accounts that were changed.
pub async fn disable_delete_from_server(engine: &dyn AccountEngine) -> Vec<AccountId> {
    let ids = match engine.get_all_account_ids().await {
        Ok(ids) => ids,
        Err(err) => {
            tracing::error!(
                target: LOG_TARGET,
                event = "fixup_delete_from_server",
                outcome = "error",
                error = %err,
            );
            return Vec::new();
        }
    };

    let mut changed = Vec::new();
    for account_id in ids {
        match fix_account(engine, account_id).await {
            Ok(true) => {
                tracing::info!(
                    target: LOG_TARGET,
                    event = "fixup_delete_from_server",
                    outcome = "cleared",
                    account_id,
                );
                changed.push(account_id);
            }
            Ok(false) => {}
            Err(err) => {
                tracing::error!(
                    target: LOG_TARGET,
                    event = "fixup_delete_from_server",
                    outcome = "error",
                    account_id,
                    error = %err,
                );
            }
        }
    }
    changed
}

async fn fix_account(engine: &dyn AccountEngine, account_id: AccountId) -> AppResult<bool> {
    let is_chatmail = engine.get_config(account_id, KEY_IS_CHATMAIL).await?;
    if is_chatmail.as_deref() != Some("1") {
        return Ok(false);
    }
    let delete_after = engine
        .get_config(account_id, KEY_DELETE_SERVER_AFTER)
        .await?;
    match delete_after.as_deref() {
        None | Some("0") => Ok(false),
        Some(_) => {
            engine
                .set_config(account_id, KEY_DELETE_SERVER_AFTER, None)
                .await?;
            Ok(true)
        }
    }
}
