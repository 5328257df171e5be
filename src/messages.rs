/// Lifecycle commands delivered over the control topics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlAnnouncement {
    /// Host went to the background: stop scanning or broadcasting.
    Suspend,
    /// Host is foregrounded again.
    Resume,
    /// Manual retry of the clock sync.
    RetrySync,
}

/// One advertisement as reported by the radio-scan collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawAdvertisement {
    /// Opaque radio-level identifier, stable per device within a session.
    pub device_id: String,
    pub name: Option<String>,
    /// dBm; 0 when the radio did not report a value.
    pub signal_strength: i32,
    pub vendor_bytes: Option<Vec<u8>>,
}
