//! Scoped mount ownership.
//!
//! A volume may already be mounted by someone else. Only the caller whose
//! `mount()` actually performed the mount releases it, exactly once, on every
//! exit path including cancellation (the guard is dropped with the future).

use crate::error::{MigrationError, Result};

/// Mount bookkeeping provided by the storage layer.
pub trait Mountable: Send + Sync {
    /// Mount if needed. Returns `true` if this call performed the mount.
    fn mount(&self) -> anyhow::Result<bool>;

    /// Unmount. Returns `true` if this call performed the unmount.
    fn unmount(&self) -> anyhow::Result<bool>;
}

pub struct MountGuard<'a, M: Mountable + ?Sized> {
    target: &'a M,
    name: String,
    owned: bool,
}

impl<'a, M: Mountable + ?Sized> MountGuard<'a, M> {
    pub fn acquire(target: &'a M, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let owned = target.mount().map_err(|e| {
            tracing::error!(volume = %name, "Failed to mount storage volume");
            MigrationError::backend(name.clone(), e.context("Failed to mount"))
        })?;
        if owned {
            tracing::debug!(volume = %name, "Mounted storage volume");
        }
        Ok(Self {
            target,
            name,
            owned,
        })
    }

    /// Whether this guard performed the mount and will release it.
    pub fn owns(&self) -> bool {
        self.owned
    }

    /// Release now and surface an unmount failure.
    pub fn release(mut self) -> Result<()> {
        if !self.owned {
            return Ok(());
        }
        self.owned = false;
        self.target
            .unmount()
            .map(|_| ())
            .map_err(|e| MigrationError::backend(self.name.clone(), e.context("Failed to unmount")))
    }
}

impl<M: Mountable + ?Sized> Drop for MountGuard<'_, M> {
    fn drop(&mut self) {
        if self.owned {
            self.owned = false;
            if let Err(e) = self.target.unmount() {
                tracing::warn!(volume = %self.name, "Failed to unmount storage volume: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeMount {
        mounted: AtomicBool,
        mounts: AtomicUsize,
        unmounts: AtomicUsize,
    }

    impl Mountable for FakeMount {
        fn mount(&self) -> anyhow::Result<bool> {
            let did = !self.mounted.swap(true, Ordering::SeqCst);
            if did {
                self.mounts.fetch_add(1, Ordering::SeqCst);
            }
            Ok(did)
        }

        fn unmount(&self) -> anyhow::Result<bool> {
            let did = self.mounted.swap(false, Ordering::SeqCst);
            if did {
                self.unmounts.fetch_add(1, Ordering::SeqCst);
            }
            Ok(did)
        }
    }

    #[test]
    fn test_guard_releases_own_mount() {
        let m = FakeMount::default();
        {
            let guard = MountGuard::acquire(&m, "vol").unwrap();
            assert!(guard.owns());
        }
        assert_eq!(m.mounts.load(Ordering::SeqCst), 1);
        assert_eq!(m.unmounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_guard_leaves_foreign_mount() {
        let m = FakeMount::default();
        m.mounted.store(true, Ordering::SeqCst);
        {
            let guard = MountGuard::acquire(&m, "vol").unwrap();
            assert!(!guard.owns());
        }
        assert!(m.mounted.load(Ordering::SeqCst));
        assert_eq!(m.unmounts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_explicit_release_is_not_repeated() {
        let m = FakeMount::default();
        let guard = MountGuard::acquire(&m, "vol").unwrap();
        guard.release().unwrap();
        assert_eq!(m.unmounts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_release_on_error_path() {
        fn failing(m: &FakeMount) -> Result<()> {
            let _guard = MountGuard::acquire(m, "vol")?;
            Err(MigrationError::Transport("reset".into()))
        }
        let m = FakeMount::default();
        assert!(failing(&m).is_err());
        assert!(!m.mounted.load(Ordering::SeqCst));
    }
}
