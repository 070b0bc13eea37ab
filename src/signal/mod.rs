pub mod barycenter;
pub mod distance;
pub mod dtw;
pub mod resample;
pub mod savgol;

pub use barycenter::dba;
pub use distance::{CondensedMatrix, DistanceMatrix, dtw_distance_matrix, euclidean_distance_matrix};
pub use dtw::{dtw_distance, dtw_path};
pub use resample::{downsample, downsample_labels, min_max_scale, resample};
pub use savgol::{SmoothingError, savgol_filter};
