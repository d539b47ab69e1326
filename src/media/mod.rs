//! Local media: capture tracks, device state and speaking detection

pub mod analyser;
pub mod controller;
pub mod device;
pub mod speaking;
pub mod synthetic;
pub mod track;

pub use controller::{
    LocalMediaState, MediaChange, MediaController, MediaEvent, MediaStatus, TrackUpdate,
};
pub use device::MediaDevices;
pub use speaking::SpeakingDetector;
pub use synthetic::{SpeechPattern, SyntheticDevices};
pub use track::{LocalTrack, TrackSource};
