use crate::{RegisterModel, Result};
use log::warn;
use std::ops::{Deref, DerefMut};

/// A restore point that is reapplied exactly once: explicitly through
/// [`RestoreGuard::restore`], or on drop when the scope is left early.
///
/// The guard borrows the register model for its whole life, so all masking
/// done under it goes through the guard.
pub struct RestoreGuard<'a> {
    register: &'a mut dyn RegisterModel,
    name: String,
    armed: bool,
}

impl<'a> RestoreGuard<'a> {
    pub fn create(register: &'a mut dyn RegisterModel, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        register.create_restore_point(&name)?;
        Ok(Self {
            register,
            name,
            armed: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn restore(mut self) -> Result<()> {
        self.armed = false;
        self.register.restore(&self.name)
    }
}

impl<'a> Deref for RestoreGuard<'a> {
    type Target = dyn RegisterModel + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.register
    }
}

impl<'a> DerefMut for RestoreGuard<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.register
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.register.restore(&self.name) {
                warn!("Failed to restore {}: {e}", self.name);
            }
        }
    }
}
