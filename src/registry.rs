// Render registry
// Tracks the splat objects a host application currently renders and hands
// out the draw order by camera distance. The shared render state (device
// profile and compute device) lives only while at least one object is
// registered: it is created by the first registration and dropped with the
// last one.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use glam::Vec3;
use tracing::{debug, info};

use crate::device::{ComputeDevice, DeviceProfile};

/// One renderable splat object
#[derive(Debug, Clone, PartialEq)]
pub struct RenderEntry {
    pub name: String,
    /// World-space anchor used for draw ordering (e.g. the scene center)
    pub position: Vec3,
}

impl RenderEntry {
    pub fn new(name: impl Into<String>, position: Vec3) -> Self {
        Self {
            name: name.into(),
            position,
        }
    }
}

/// State shared by every registered object
#[derive(Debug, Clone)]
pub struct SharedRenderState {
    pub profile: DeviceProfile,
    pub device: Arc<ComputeDevice>,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    entries: Vec<(u64, RenderEntry)>,
    shared: Option<SharedRenderState>,
}

/// Explicit registry of active render objects. Cloning yields another handle
/// to the same registry.
#[derive(Clone)]
pub struct RenderRegistry {
    profile: DeviceProfile,
    inner: Arc<Mutex<RegistryInner>>,
}

impl Default for RenderRegistry {
    fn default() -> Self {
        Self::new(DeviceProfile::default())
    }
}

impl RenderRegistry {
    /// `profile` is used whenever the shared state is (re)created
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            inner: Arc::new(Mutex::new(RegistryInner::default())),
        }
    }

    fn lock(inner: &Mutex<RegistryInner>) -> MutexGuard<'_, RegistryInner> {
        // entries stay consistent even if a holder panicked
        inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, entry: RenderEntry) -> Registration {
        let mut inner = Self::lock(&self.inner);
        if inner.shared.is_none() {
            info!("Creating shared render state for '{}'", entry.name);
            inner.shared = Some(SharedRenderState {
                profile: self.profile.clone(),
                device: Arc::new(ComputeDevice::new(self.profile.clone())),
            });
        }
        let id = inner.next_id;
        inner.next_id += 1;
        debug!("Registered render entry '{}' (id {})", entry.name, id);
        inner.entries.push((id, entry));

        Registration {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        Self::lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shared state exists (at least one live registration)
    pub fn is_active(&self) -> bool {
        Self::lock(&self.inner).shared.is_some()
    }

    pub fn shared_device(&self) -> Option<Arc<ComputeDevice>> {
        Self::lock(&self.inner)
            .shared
            .as_ref()
            .map(|s| s.device.clone())
    }

    pub fn shared_state(&self) -> Option<SharedRenderState> {
        Self::lock(&self.inner).shared.clone()
    }

    /// Registered entries, farthest from `camera_pos` first. Entries at
    /// equal distance keep registration order.
    pub fn draw_order(&self, camera_pos: Vec3) -> Vec<RenderEntry> {
        let inner = Self::lock(&self.inner);
        let mut entries: Vec<(f32, &RenderEntry)> = inner
            .entries
            .iter()
            .map(|(_, e)| (e.position.distance_squared(camera_pos), e))
            .collect();
        entries.sort_by(|a, b| b.0.total_cmp(&a.0));
        entries.into_iter().map(|(_, e)| e.clone()).collect()
    }
}

/// Keeps an entry registered; unregisters on drop
#[derive(Debug)]
pub struct Registration {
    id: u64,
    registry: Weak<Mutex<RegistryInner>>,
}

impl Registration {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Moves the entry's draw-order anchor
    pub fn set_position(&self, position: Vec3) {
        if let Some(inner) = self.registry.upgrade() {
            let mut inner = RenderRegistry::lock(&inner);
            if let Some((_, entry)) = inner.entries.iter_mut().find(|(id, _)| *id == self.id) {
                entry.position = position;
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut inner = RenderRegistry::lock(&inner);
        inner.entries.retain(|(id, _)| *id != self.id);
        if inner.entries.is_empty() && inner.shared.take().is_some() {
            info!("Last render entry unregistered, releasing shared render state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_state_lifetime() {
        let registry = RenderRegistry::default();
        assert!(!registry.is_active());

        let a = registry.register(RenderEntry::new("a", Vec3::ZERO));
        let device = registry.shared_device().unwrap();
        let b = registry.register(RenderEntry::new("b", Vec3::X));
        assert!(Arc::ptr_eq(&device, &registry.shared_device().unwrap()));
        assert_eq!(registry.len(), 2);

        drop(a);
        assert!(registry.is_active());
        drop(b);
        assert!(!registry.is_active());
        assert!(registry.is_empty());

        // recreated on next use
        let _c = registry.register(RenderEntry::new("c", Vec3::ZERO));
        assert!(!Arc::ptr_eq(&device, &registry.shared_device().unwrap()));
    }

    #[test]
    fn test_draw_order_farthest_first() {
        let registry = RenderRegistry::default();
        let _near = registry.register(RenderEntry::new("near", Vec3::new(0.0, 0.0, -1.0)));
        let far = registry.register(RenderEntry::new("far", Vec3::new(0.0, 0.0, -10.0)));
        let _mid = registry.register(RenderEntry::new("mid", Vec3::new(0.0, 0.0, -5.0)));

        let names: Vec<_> = registry.draw_order(Vec3::ZERO).into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["far", "mid", "near"]);

        far.set_position(Vec3::new(0.0, 0.0, -0.5));
        let names: Vec<_> = registry.draw_order(Vec3::ZERO).into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["mid", "near", "far"]);
    }

    #[test]
    fn test_registration_outlives_registry() {
        let registry = RenderRegistry::default();
        let entry = registry.register(RenderEntry::new("orphan", Vec3::ZERO));
        drop(registry);
        entry.set_position(Vec3::ONE);
        drop(entry);
    }
}
