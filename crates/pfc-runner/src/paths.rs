use crate::config::{PhaseParams, Rotation, Shape};
use std::path::{Path, PathBuf};

pub const RUNNING_FILE: &str = ".running";
pub const CALC_FILE: &str = "calc.json";
pub const LOG_FILE: &str = "log.json";
pub const INTERFACES_DIR: &str = "interfaces";

pub const UNIT_SOL_FILE: &str = "unit_sol.field";
pub const UNIT_LIQ_FILE: &str = "unit_liq.field";
pub const SOLID_FILE: &str = "solid.field";
pub const LIQUID_FILE: &str = "liquid.field";
pub const LONG_SOLID_FILE: &str = "long_solid.field";
pub const LONG_LIQUID_FILE: &str = "long_liquid.field";
pub const INTERFACE_FILE: &str = "interface.field";

const CHECKPOINT_EXT: &str = ".field";

pub fn phase_path(data_dir: &Path, shape: Shape, phase: &PhaseParams) -> PathBuf {
    data_dir
        .join(format!("{}x{}", shape.nx, shape.ny))
        .join(format!("eps_{}", phase.eps))
        .join(format!("alpha_{}", phase.alpha))
        .join(format!("beta_{}", phase.beta))
}

pub fn angle_path(data_dir: &Path, shape: Shape, phase: &PhaseParams, rotation: Rotation) -> PathBuf {
    phase_path(data_dir, shape, phase).join(format!("theta_{:.4}", rotation.theta))
}

pub fn checkpoint_name(index: usize) -> String {
    format!("{:04}{}", index, CHECKPOINT_EXT)
}

pub fn parse_checkpoint_name(name: &str) -> Option<usize> {
    let stem = name.strip_suffix(CHECKPOINT_EXT)?;
    if stem.len() < 4 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase() -> PhaseParams {
        PhaseParams {
            eps: "0.1".to_string(),
            alpha: "0.5".to_string(),
            beta: "1".to_string(),
        }
    }

    #[test]
    fn phase_and_angle_paths_follow_layout() {
        let shape = Shape { nx: 64, ny: 32 };
        assert_eq!(
            phase_path(Path::new("data"), shape, &phase()),
            PathBuf::from("data/64x32/eps_0.1/alpha_0.5/beta_1")
        );
        assert_eq!(
            angle_path(Path::new("data"), shape, &phase(), Rotation::new(1, 1)),
            PathBuf::from("data/64x32/eps_0.1/alpha_0.5/beta_1/theta_0.5236")
        );
        assert_eq!(
            angle_path(Path::new("data"), shape, &phase(), Rotation::new(1, 0)),
            PathBuf::from("data/64x32/eps_0.1/alpha_0.5/beta_1/theta_0.0000")
        );
    }

    #[test]
    fn checkpoint_names_round_trip() {
        assert_eq!(checkpoint_name(0), "0000.field");
        assert_eq!(checkpoint_name(12345), "12345.field");
        assert_eq!(parse_checkpoint_name("0007.field"), Some(7));
        assert_eq!(parse_checkpoint_name("12345.field"), Some(12345));
        assert_eq!(parse_checkpoint_name("7.field"), None);
        assert_eq!(parse_checkpoint_name(".0001.field.tmp.1.2"), None);
        assert_eq!(parse_checkpoint_name("interface.field"), None);
    }
}
