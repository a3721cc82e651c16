//! Switching to an unprivileged account after start-up

use nix::unistd::{self, Gid, Group, Uid, User};
use tracing::{debug, info};

use crate::config::DaemonSettings;
use crate::error::DaemonError;

/// Switches to `daemon.user` (`nobody` when unset) and `daemon.group`, else
/// that user's primary group, when running as root. A no-op otherwise.
pub fn drop_privileges(settings: &DaemonSettings) -> Result<(), DaemonError> {
    if !Uid::effective().is_root() {
        debug!("Not running as root, staying {}", Uid::effective());
        return Ok(());
    }
    let user_name = settings.target_user();
    let user = User::from_name(user_name)
        .map_err(|e| DaemonError::Privileges(format!("lookup of user {:?}: {}", user_name, e)))?
        .ok_or_else(|| DaemonError::Privileges(format!("unknown user {:?}", user_name)))?;
    let gid = match settings.group {
        Some(ref group_name) => lookup_group(group_name)?,
        None => user.gid,
    };

    // Group first: setgid is no longer allowed once the uid is dropped
    #[cfg(target_os = "linux")]
    unistd::setgroups(&[gid]).map_err(|e| DaemonError::Privileges(format!("setgroups: {}", e)))?;
    unistd::setgid(gid).map_err(|e| DaemonError::Privileges(format!("setgid({}): {}", gid, e)))?;
    unistd::setuid(user.uid)
        .map_err(|e| DaemonError::Privileges(format!("setuid({}): {}", user.uid, e)))?;

    info!("Running as {} (uid {}, gid {})", user_name, user.uid, gid);
    Ok(())
}

fn lookup_group(name: &str) -> Result<Gid, DaemonError> {
    Group::from_name(name)
        .map_err(|e| DaemonError::Privileges(format!("lookup of group {:?}: {}", name, e)))?
        .map(|group| group.gid)
        .ok_or_else(|| DaemonError::Privileges(format!("unknown group {:?}", name)))
}
