//! Pixel pitch of known Basler models, in micrometres.

use once_cell::sync::Lazy;
use std::collections::HashMap;

static PIXEL_LENGTHS_UM: Lazy<HashMap<&'static str, f64>> = Lazy::new(|| {
    HashMap::from([
        ("daA1280-54um", 3.75),
        ("daA1280-54uc", 3.75),
        ("daA1600-60um", 4.5),
        ("daA2500-14um", 2.2),
        ("acA640-120um", 5.6),
        ("acA640-120gm", 5.6),
        ("acA1300-200um", 4.8),
        ("acA1920-40um", 5.86),
        ("acA2040-90um", 5.5),
        ("a2A1920-160umBAS", 2.74),
    ])
});

/// Pixel size of `model_name` in um, `None` for models not in the table.
pub fn pixel_length_um(model_name: &str) -> Option<f64> {
    PIXEL_LENGTHS_UM.get(model_name.trim()).copied()
}
