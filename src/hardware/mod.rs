//! Basler Camera Hardware
//!
//! Pylon transport-layer abstraction, its simulated and SDK backends, and the
//! Basler camera controller built on top of them.

pub mod basler;
pub mod mock;
pub mod pixel_size;
pub mod pylon_adapter;
#[cfg(feature = "pylon_hardware")]
pub mod pylon_sdk;

use std::sync::Arc;

use crate::error::AppResult;

pub use basler::{detector_clamp, BaslerCamera, GainMode, DEFAULT_GRAB_TIMEOUT};
pub use mock::{MockPylonAdapter, SimulatedDevice};
pub use pixel_size::pixel_length_um;
pub use pylon_adapter::{
    DeviceHandle, FloatRange, GrabEvent, GrabGuard, GrabStrategy, GrabbedImage, IntegerRange,
    NodeValue, PylonAdapter,
};
#[cfg(feature = "pylon_hardware")]
pub use pylon_sdk::PylonSdkAdapter;

/// Simulated devices when `mock` is set, otherwise the Pylon SDK.
///
/// Asking for the SDK fails with
/// [`FeatureNotEnabled`](crate::error::DaqError::FeatureNotEnabled) unless the
/// crate was built with `pylon_hardware`.
pub fn default_adapter(mock: bool) -> AppResult<Arc<dyn PylonAdapter>> {
    if mock {
        return Ok(Arc::new(MockPylonAdapter::new()));
    }
    #[cfg(feature = "pylon_hardware")]
    {
        Ok(Arc::new(PylonSdkAdapter::new()?))
    }
    #[cfg(not(feature = "pylon_hardware"))]
    {
        Err(crate::error::DaqError::FeatureNotEnabled(
            "pylon_hardware".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_adapter_lists_simulated_cameras() {
        let adapter = default_adapter(true).unwrap();
        assert_eq!(adapter.enumerate_devices().unwrap().len(), 2);
    }

    #[cfg(not(feature = "pylon_hardware"))]
    #[test]
    fn test_sdk_adapter_needs_feature() {
        use crate::error::DaqError;

        let err = default_adapter(false).err().unwrap();
        assert!(matches!(err, DaqError::FeatureNotEnabled(ref f) if f == "pylon_hardware"));
        assert_eq!(
            err.to_string(),
            "Feature 'pylon_hardware' is not enabled. Please build with --features pylon_hardware"
        );
    }
}
