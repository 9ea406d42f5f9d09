//! Client-reset bookkeeping: fresh-copy and recovery path derivation, and
//! the per-session reset operation finalized when the server re-idents the
//! file.

use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use time::macros::format_description;

use crate::config::ClientResyncMode;
use crate::core::{ClientErrorCode, IntegrationError, SaltedFileIdent};
use crate::replication::{ReplicationHistory, SessionStores};

/// Path of the side store a fresh server state is downloaded into.
pub fn fresh_path_for(store_path: &Path) -> PathBuf {
    let mut path = store_path.as_os_str().to_os_string();
    path.push(".fresh");
    PathBuf::from(path)
}

/// Backup location used when the server asks for the file to be deleted.
pub fn recovery_backup_path(recovery_directory: &Path, now: OffsetDateTime) -> PathBuf {
    let format = format_description!("[year][month][day]-[hour][minute][second]");
    let stamp = now.format(&format).unwrap_or_default();
    recovery_directory.join(format!("recovered_store_{stamp}"))
}

/// One client reset in flight on a session.
///
/// Created when the facade has finished downloading the fresh copy and
/// restarted the session; finalized when the server delivers the file
/// identifier through IDENT.
pub struct ClientResetOperation {
    mode: ClientResyncMode,
    fresh: Option<SessionStores>,
    recovery_allowed: bool,
}

impl ClientResetOperation {
    pub fn new(mode: ClientResyncMode, fresh: Option<SessionStores>, recovery_allowed: bool) -> Self {
        Self {
            mode,
            fresh,
            recovery_allowed,
        }
    }

    pub fn mode(&self) -> ClientResyncMode {
        self.mode
    }

    /// Copy the fresh state over the primary file. Returns false when there
    /// was nothing to reset. The fresh store handle is consumed either way;
    /// it must not outlive the reset.
    pub fn finalize(
        mut self,
        file_ident: SaltedFileIdent,
        primary: &mut dyn ReplicationHistory,
    ) -> Result<bool, IntegrationError> {
        let Some(fresh) = self.fresh.take() else {
            return Ok(false);
        };
        let mut fresh_history = fresh.history.lock().map_err(|_| {
            IntegrationError::new(
                ClientErrorCode::AutoClientResetFailure,
                "fresh store handle poisoned",
            )
        })?;
        tracing::debug!(
            target: "sync::session",
            mode = ?self.mode,
            recovery_allowed = self.recovery_allowed,
            "finalizing client reset"
        );
        primary.perform_client_reset(
            file_ident,
            &mut *fresh_history,
            self.mode,
            self.recovery_allowed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn fresh_path_appends_suffix() {
        assert_eq!(
            fresh_path_for(Path::new("/data/app.lagoon")),
            PathBuf::from("/data/app.lagoon.fresh")
        );
    }

    #[test]
    fn recovery_path_carries_date_and_prefix() {
        let path = recovery_backup_path(
            Path::new("/data/recovery"),
            datetime!(2024-07-09 13:45:09 UTC),
        );
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "recovered_store_20240709-134509");
        assert!(path.starts_with("/data/recovery"));
    }
}
