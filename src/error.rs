use thiserror::Error;

/// Failures surfaced by the beacon protocol engine.
///
/// None of these are fatal: a failed sync can be retried, a rejected action
/// leaves state untouched, and malformed payloads only affect the
/// advertisement that carried them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BeaconError {
    /// Time source unreachable or answered with a non-success status.
    #[error("time source unreachable: {0}")]
    Network(String),
    /// Time source answered but without a usable time field.
    #[error("malformed time response: {0}")]
    Protocol(String),
    /// Action attempted in the wrong state.
    #[error("precondition failed: {0}")]
    Precondition(&'static str),
    #[error("cannot encode payload: {0}")]
    Encoding(String),
    #[error("cannot decode payload: {0}")]
    Decoding(String),
    /// An external radio, advertise or notification collaborator failed.
    #[error("radio collaborator failed: {0}")]
    Radio(String),
}

impl BeaconError {
    pub fn radio(err: anyhow::Error) -> Self {
        BeaconError::Radio(format!("{err:#}"))
    }
}
