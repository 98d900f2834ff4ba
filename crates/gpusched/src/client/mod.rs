pub mod queue;
pub mod shell;
pub mod submit;

use crate::common::error::SchedError;

/// Name of the user running this process.
pub fn current_user() -> crate::Result<String> {
    let uid = nix::unistd::getuid();
    nix::unistd::User::from_uid(uid)?
        .map(|user| user.name)
        .ok_or_else(|| SchedError::SystemError(format!("Cannot find user with uid {uid}")))
}
