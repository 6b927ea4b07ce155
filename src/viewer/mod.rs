//! Camera viewer layer
//!
//! Host-facing logic of a 2D camera viewer: a typed settings tree, ROI and
//! binning handling, data emission and FPS display. It is generic over
//! [`CameraSensor`](crate::traits::CameraSensor) controllers.

pub mod data;
pub mod fps;
pub mod generic;
pub mod observable;
pub mod settings;

pub use data::{Axis, DataDim, DataExport, DataFromCamera, ViewerEvent};
pub use fps::FpsCounter;
pub use generic::{GenericCameraViewer, RoiRect};
pub use observable::{Observable, ObservableMetadata, ParamKind, ParameterBase};
pub use settings::ViewerSettings;
