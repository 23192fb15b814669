use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::errors::HuddleError;

use super::ports::{AudioSourcePort, VideoSourcePort};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Camera,
    Microphone,
    Speaker,
}

impl DeviceKind {
    fn label(self) -> &'static str {
        match self {
            DeviceKind::Camera => "camera",
            DeviceKind::Microphone => "microphone",
            DeviceKind::Speaker => "speaker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub kind: DeviceKind,
    pub in_use: bool,
    pub selected: bool,
}

#[derive(Clone)]
enum DeviceSource {
    Video(Arc<dyn VideoSourcePort>),
    Audio(Arc<dyn AudioSourcePort>),
    Output,
}

struct DeviceEntry {
    id: String,
    name: String,
    kind: DeviceKind,
    source: DeviceSource,
    leased: bool,
}

#[derive(Default)]
struct RegistryState {
    devices: Vec<DeviceEntry>,
    camera_denied: bool,
    microphone_denied: bool,
    selected_camera: Option<String>,
    selected_microphone: Option<String>,
    output_route: Option<String>,
}

impl RegistryState {
    fn selected(&self, kind: DeviceKind) -> Option<&String> {
        match kind {
            DeviceKind::Camera => self.selected_camera.as_ref(),
            DeviceKind::Microphone => self.selected_microphone.as_ref(),
            DeviceKind::Speaker => self.output_route.as_ref(),
        }
    }

    fn denied(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Camera => self.camera_denied,
            DeviceKind::Microphone => self.microphone_denied,
            DeviceKind::Speaker => false,
        }
    }

    /// Explicit id, else the selected device, else the first one registered.
    fn resolve(&self, kind: DeviceKind, id: Option<&str>) -> Option<usize> {
        let wanted = id.map(str::to_string).or_else(|| self.selected(kind).cloned());
        self.devices.iter().position(|d| {
            d.kind == kind && wanted.as_ref().is_none_or(|w| &d.id == w)
        })
    }
}

/// Capture and output devices known to the engine.
///
/// Platform code registers devices with the source port that produces
/// their frames. A capture device is held by at most one pipeline at a
/// time through a [`DeviceLease`].
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    state: Arc<Mutex<RegistryState>>,
}

/// Exclusive hold on a capture device. Released on drop.
pub struct DeviceLease {
    state: Arc<Mutex<RegistryState>>,
    id: String,
}

impl std::fmt::Debug for DeviceLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLease").field("id", &self.id).finish()
    }
}

impl DeviceLease {
    pub fn device_id(&self) -> &str {
        &self.id
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(entry) = state.devices.iter_mut().find(|d| d.id == self.id) {
                entry.leased = false;
            }
        }
        tracing::debug!(device = %self.id, "device released");
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().expect("device registry lock poisoned")
    }

    fn register(&self, id: &str, name: &str, kind: DeviceKind, source: DeviceSource) {
        let mut state = self.lock();
        state.devices.retain(|d| d.id != id);
        state.devices.push(DeviceEntry {
            id: id.to_string(),
            name: name.to_string(),
            kind,
            source,
            leased: false,
        });
        tracing::info!(device = id, kind = kind.label(), "device registered");
    }

    pub fn register_camera(&self, id: &str, name: &str, source: Arc<dyn VideoSourcePort>) {
        self.register(id, name, DeviceKind::Camera, DeviceSource::Video(source));
    }

    pub fn register_microphone(&self, id: &str, name: &str, source: Arc<dyn AudioSourcePort>) {
        self.register(id, name, DeviceKind::Microphone, DeviceSource::Audio(source));
    }

    pub fn register_speaker(&self, id: &str, name: &str) {
        self.register(id, name, DeviceKind::Speaker, DeviceSource::Output);
    }

    /// A leased device keeps working until its pipeline stops.
    pub fn unregister(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.devices.len();
        state.devices.retain(|d| d.id != id);
        before != state.devices.len()
    }

    pub fn list(&self, kind: DeviceKind) -> Vec<DeviceInfo> {
        let state = self.lock();
        let selected = state.selected(kind).cloned();
        state
            .devices
            .iter()
            .filter(|d| d.kind == kind)
            .map(|d| DeviceInfo {
                id: d.id.clone(),
                name: d.name.clone(),
                kind: d.kind,
                in_use: d.leased,
                selected: selected.as_deref() == Some(d.id.as_str()),
            })
            .collect()
    }

    /// Mirror of the OS permission state for a capture device class.
    pub fn set_permission(&self, kind: DeviceKind, granted: bool) {
        let mut state = self.lock();
        match kind {
            DeviceKind::Camera => state.camera_denied = !granted,
            DeviceKind::Microphone => state.microphone_denied = !granted,
            DeviceKind::Speaker => {}
        }
    }

    fn select(&self, kind: DeviceKind, id: &str) -> Result<(), HuddleError> {
        let mut state = self.lock();
        if !state.devices.iter().any(|d| d.kind == kind && d.id == id) {
            return Err(HuddleError::DeviceUnavailable(id.to_string()));
        }
        let slot = match kind {
            DeviceKind::Camera => &mut state.selected_camera,
            DeviceKind::Microphone => &mut state.selected_microphone,
            DeviceKind::Speaker => &mut state.output_route,
        };
        *slot = Some(id.to_string());
        Ok(())
    }

    pub fn select_camera(&self, id: &str) -> Result<(), HuddleError> {
        self.select(DeviceKind::Camera, id)
    }

    pub fn select_microphone(&self, id: &str) -> Result<(), HuddleError> {
        self.select(DeviceKind::Microphone, id)
    }

    pub fn set_output_route(&self, id: &str) -> Result<(), HuddleError> {
        self.select(DeviceKind::Speaker, id)
    }

    pub fn output_route(&self) -> Option<String> {
        self.lock().output_route.clone()
    }

    fn lease(
        &self,
        kind: DeviceKind,
        id: Option<&str>,
    ) -> Result<(DeviceLease, DeviceSource), HuddleError> {
        let mut state = self.lock();
        if state.denied(kind) {
            return Err(HuddleError::PermissionRequired(kind.label().to_string()));
        }
        let idx = state.resolve(kind, id).ok_or_else(|| {
            HuddleError::DeviceUnavailable(id.unwrap_or(kind.label()).to_string())
        })?;
        let entry = &mut state.devices[idx];
        if entry.leased {
            return Err(HuddleError::DeviceUnavailable(format!("{} is in use", entry.id)));
        }
        entry.leased = true;
        tracing::debug!(device = %entry.id, "device leased");
        Ok((
            DeviceLease {
                state: self.state.clone(),
                id: entry.id.clone(),
            },
            entry.source.clone(),
        ))
    }

    pub fn lease_camera(
        &self,
        id: Option<&str>,
    ) -> Result<(DeviceLease, Arc<dyn VideoSourcePort>), HuddleError> {
        match self.lease(DeviceKind::Camera, id)? {
            (lease, DeviceSource::Video(source)) => Ok((lease, source)),
            _ => Err(HuddleError::Internal("camera without a video source".into())),
        }
    }

    pub fn lease_microphone(
        &self,
        id: Option<&str>,
    ) -> Result<(DeviceLease, Arc<dyn AudioSourcePort>), HuddleError> {
        match self.lease(DeviceKind::Microphone, id)? {
            (lease, DeviceSource::Audio(source)) => Ok((lease, source)),
            _ => Err(HuddleError::Internal("microphone without an audio source".into())),
        }
    }

    pub fn is_leased(&self, id: &str) -> bool {
        self.lock().devices.iter().any(|d| d.id == id && d.leased)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ports::VideoFrameSender;

    struct NullCamera;

    impl VideoSourcePort for NullCamera {
        fn on_start(&self, _sender: VideoFrameSender) {}
        fn on_stop(&self) {}
    }

    fn registry() -> DeviceRegistry {
        let devices = DeviceRegistry::new();
        devices.register_camera("front", "Front", Arc::new(NullCamera));
        devices.register_camera("back", "Back", Arc::new(NullCamera));
        devices
    }

    #[test]
    fn lease_is_exclusive_and_released_on_drop() {
        let devices = registry();
        let (lease, _) = devices.lease_camera(Some("front")).unwrap();
        assert!(devices.is_leased("front"));
        assert!(matches!(
            devices.lease_camera(Some("front")),
            Err(HuddleError::DeviceUnavailable(_))
        ));
        drop(lease);
        assert!(!devices.is_leased("front"));
        assert!(devices.lease_camera(Some("front")).is_ok());
    }

    #[test]
    fn default_device_follows_selection() {
        let devices = registry();
        let (lease, _) = devices.lease_camera(None).unwrap();
        assert_eq!(lease.device_id(), "front");
        drop(lease);

        devices.select_camera("back").unwrap();
        let (lease, _) = devices.lease_camera(None).unwrap();
        assert_eq!(lease.device_id(), "back");
        let listed = devices.list(DeviceKind::Camera);
        assert!(listed.iter().any(|d| d.id == "back" && d.selected && d.in_use));
    }

    #[test]
    fn permission_and_missing_devices() {
        let devices = registry();
        devices.set_permission(DeviceKind::Camera, false);
        assert_eq!(
            devices.lease_camera(None).err(),
            Some(HuddleError::PermissionRequired("camera".into()))
        );
        assert!(matches!(
            devices.lease_microphone(None),
            Err(HuddleError::DeviceUnavailable(_))
        ));
        assert!(devices.select_microphone("nope").is_err());
    }
}
