//! Container user identity and impersonation

use crate::error::Result;

/// The local account a container's processes, ACLs and firewall rules are
/// scoped to
pub trait ContainerUser: Send + Sync {
    fn principal(&self) -> &str;

    /// Switch the calling thread to this user until the guard drops
    fn impersonate(&self) -> Result<ImpersonationGuard>;
}

/// Reverts an impersonation when dropped
#[must_use = "impersonation ends when the guard is dropped"]
pub struct ImpersonationGuard {
    revert: Option<Box<dyn FnOnce() + Send>>,
}

impl ImpersonationGuard {
    pub fn new(revert: impl FnOnce() + Send + 'static) -> Self {
        Self {
            revert: Some(Box::new(revert)),
        }
    }
}

impl Drop for ImpersonationGuard {
    fn drop(&mut self) {
        if let Some(revert) = self.revert.take() {
            revert();
        }
    }
}

#[cfg(windows)]
pub use self::windows::LocalUser;

#[cfg(windows)]
mod windows {
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;

    use tracing::{debug, warn};
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::Security::{
        ImpersonateLoggedOnUser, LogonUserW, RevertToSelf, LOGON32_LOGON_INTERACTIVE,
        LOGON32_PROVIDER_DEFAULT,
    };

    use super::{ContainerUser, ImpersonationGuard};
    use crate::error::{ContainmentError, OsError, Result};

    fn wide(s: &str) -> Vec<u16> {
        OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
    }

    /// Local machine account with known credentials
    pub struct LocalUser {
        name: String,
        password: String,
    }

    impl LocalUser {
        pub fn new(name: impl Into<String>, password: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                password: password.into(),
            }
        }
    }

    impl std::fmt::Debug for LocalUser {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("LocalUser")
                .field("name", &self.name)
                .finish_non_exhaustive()
        }
    }

    impl ContainerUser for LocalUser {
        fn principal(&self) -> &str {
            &self.name
        }

        fn impersonate(&self) -> Result<ImpersonationGuard> {
            let name = wide(&self.name);
            let domain = wide(".");
            let password = wide(&self.password);
            let mut token: HANDLE = 0;

            let ok = unsafe {
                LogonUserW(
                    name.as_ptr(),
                    domain.as_ptr(),
                    password.as_ptr(),
                    LOGON32_LOGON_INTERACTIVE,
                    LOGON32_PROVIDER_DEFAULT,
                    &mut token,
                )
            };
            if ok == 0 {
                return Err(ContainmentError::os("LogonUserW", OsError::last()));
            }

            if unsafe { ImpersonateLoggedOnUser(token) } == 0 {
                let error = OsError::last();
                unsafe { CloseHandle(token) };
                return Err(ContainmentError::os("ImpersonateLoggedOnUser", error));
            }

            debug!(user = %self.name, "Impersonating container user");
            Ok(ImpersonationGuard::new(move || unsafe {
                if RevertToSelf() == 0 {
                    warn!(error = %OsError::last(), "RevertToSelf failed");
                }
                CloseHandle(token);
            }))
        }
    }
}
