//! Patient metadata encoding for the fusion network.
//!
//! Maps (age, sex, body location) to the fixed 19-dimensional feature
//! vector the metadata branch was trained on.
//!
//! # Feature Vector Layout (19 dimensions)
//!
//! | Index | Feature                               | Type    |
//! |-------|---------------------------------------|---------|
//! | 0     | Standardized age                      | Numeric |
//! | 1–3   | One-hot sex (female, male, unknown)   | Binary  |
//! | 4–18  | One-hot body location (15 categories) | Binary  |
//!
//! Categorical inputs are lowercased before lookup; a value outside the
//! fixed catalog leaves its one-hot block all-zero rather than failing.
//! Age is standardized with fixed training-set constants and is never
//! validated or clamped — out-of-range inputs pass through as-is.

use dermalens_core::{LOCATION_CATEGORIES, NUM_META_FEATURES, SEX_CATEGORIES};

/// Training-set age mean (HAM10000 metadata).
pub const AGE_MEAN: f32 = 51.86;

/// Training-set age standard deviation (HAM10000 metadata).
pub const AGE_STD: f32 = 16.96;

/// First slot of the sex one-hot block.
const SEX_OFFSET: usize = 1;

/// First slot of the body-location one-hot block.
const LOCATION_OFFSET: usize = SEX_OFFSET + SEX_CATEGORIES.len();

/// Encode patient metadata into the fixed-length feature vector.
///
/// Never fails: unrecognized sex or location strings silently leave their
/// one-hot block zeroed, and any numeric age is accepted.
#[must_use]
pub fn encode(age: f32, sex: &str, location: &str) -> [f32; NUM_META_FEATURES] {
    let mut features = [0.0_f32; NUM_META_FEATURES];

    features[0] = (age - AGE_MEAN) / AGE_STD;

    let sex_key = sex.to_lowercase();
    if let Some(idx) = SEX_CATEGORIES.iter().position(|c| *c == sex_key) {
        features[SEX_OFFSET + idx] = 1.0;
    }

    let location_key = location.to_lowercase();
    if let Some(idx) = LOCATION_CATEGORIES
        .iter()
        .position(|c| *c == location_key)
    {
        features[LOCATION_OFFSET + idx] = 1.0;
    }

    features
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_length() {
        let features = encode(45.0, "male", "back");
        assert_eq!(features.len(), NUM_META_FEATURES);
        assert_eq!(features.len(), 19);
    }

    #[test]
    fn test_mean_age_standardizes_to_zero() {
        let features = encode(51.86, "female", "face");
        assert!(features[0].abs() < 1e-5, "Expected ~0.0, got {}", features[0]);
    }

    #[test]
    fn test_age_standardization() {
        let features = encode(51.86 + 16.96, "female", "face");
        assert!((features[0] - 1.0).abs() < 1e-5);
        let features = encode(51.86 - 2.0 * 16.96, "female", "face");
        assert!((features[0] + 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_age_not_clamped() {
        // Out-of-policy ages pass through standardization untouched.
        let features = encode(-40.0, "male", "back");
        assert!(features[0] < -5.0);
        let features = encode(500.0, "male", "back");
        assert!(features[0] > 25.0);
    }

    #[test]
    fn test_sex_one_hot_slots() {
        let female = encode(45.0, "female", "back");
        assert_eq!(&female[1..4], &[1.0, 0.0, 0.0]);

        let male = encode(45.0, "male", "back");
        assert_eq!(&male[1..4], &[0.0, 1.0, 0.0]);

        let unknown = encode(45.0, "unknown", "back");
        assert_eq!(&unknown[1..4], &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_sex_lookup_is_case_insensitive() {
        let features = encode(45.0, "Male", "back");
        assert_eq!(&features[1..4], &[0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_location_one_hot_slot() {
        // "back" is the third location category -> slot 4 + 2.
        let features = encode(45.0, "male", "back");
        assert_eq!(features[6], 1.0);
        let set: Vec<usize> = (4..19).filter(|&i| features[i] != 0.0).collect();
        assert_eq!(set, [6]);
    }

    #[test]
    fn test_location_with_space() {
        let features = encode(45.0, "female", "Lower Extremity");
        let idx = LOCATION_CATEGORIES
            .iter()
            .position(|c| *c == "lower extremity")
            .unwrap();
        assert_eq!(features[LOCATION_OFFSET + idx], 1.0);
    }

    #[test]
    fn test_unrecognized_location_leaves_block_zero() {
        let features = encode(45.0, "male", "mars");
        assert!(features[4..19].iter().all(|&v| v == 0.0));
        // Age and sex slots are unaffected.
        assert_eq!(features[2], 1.0);
    }

    #[test]
    fn test_unrecognized_sex_leaves_block_zero() {
        let features = encode(45.0, "other", "back");
        assert!(features[1..4].iter().all(|&v| v == 0.0));
        assert_eq!(features[6], 1.0);
    }

    #[test]
    fn test_at_most_one_slot_per_block() {
        for sex in ["female", "male", "unknown", "n/a"] {
            for location in ["back", "scalp", "nowhere"] {
                let features = encode(30.0, sex, location);
                let sex_set = features[1..4].iter().filter(|&&v| v != 0.0).count();
                let loc_set = features[4..19].iter().filter(|&&v| v != 0.0).count();
                assert!(sex_set <= 1);
                assert!(loc_set <= 1);
            }
        }
    }
}
