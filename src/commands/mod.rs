pub mod detect;
pub mod fit;
pub mod simulate;

pub use detect::detect_stars_in_file;
pub use fit::{fit_points_file, load_points};
pub use simulate::{run_simulation, SimulateArgs};
