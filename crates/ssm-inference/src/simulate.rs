//! Simulation from a model specification.
//!
//! - `x_0 ~ N(x0, V0)`
//! - `x_t = B x_{t-1} + w_t`, `w_t ~ N(0, Q)`
//! - `y_t = Z_t x_t + v_t`,   `v_t ~ N(0, R)`
//!
//! Noise covariances only need to be PSD (fixed-zero variances are common).

use nalgebra::{DMatrix, DVector};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};
use ssm_core::{Error, NumericalFailure, Observations, Result, Stage};

use crate::linalg::{condition_number, psd_sqrt};
use crate::spec::ModelSpec;

/// Simulated paths.
#[derive(Debug, Clone)]
pub struct Simulation {
    /// Latent states `x_1..x_T`.
    pub xs: Vec<DVector<f64>>,
    /// Observations `y_1..y_T`.
    pub ys: Vec<DVector<f64>>,
}

impl Simulation {
    /// The observations as a validated series.
    pub fn observations(&self) -> Result<Observations> {
        Observations::new(self.ys.clone())
    }
}

fn noise_factor(cov: &DMatrix<f64>, what: &str) -> Result<DMatrix<f64>> {
    psd_sqrt(cov).ok_or_else(|| {
        Error::Numerical(NumericalFailure::new(
            Stage::Simulation,
            0,
            condition_number(cov),
            format!("{what} is not positive semi-definite"),
        ))
    })
}

fn draw(rng: &mut StdRng, l: &DMatrix<f64>) -> DVector<f64> {
    let z = DVector::<f64>::from_fn(l.ncols(), |_, _| StandardNormal.sample(rng));
    l * z
}

/// Simulate `t_max` steps with a seeded RNG.
///
/// A model with time-varying `Z` must be simulated for exactly its declared number of steps.
pub fn simulate(spec: &ModelSpec, t_max: usize, seed: u64) -> Result<Simulation> {
    if t_max == 0 {
        return Err(Error::Validation("t_max must be > 0".to_string()));
    }
    if let Some(n) = spec.z_periods() {
        if n != t_max {
            return Err(Error::Configuration(format!(
                "time-varying Z declares {n} steps, cannot simulate {t_max}"
            )));
        }
    }

    let l_q = noise_factor(spec.q(), "Q")?;
    let l_r = noise_factor(spec.r(), "R")?;
    let l_v0 = noise_factor(spec.v0(), "V0")?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = spec.x0() + draw(&mut rng, &l_v0);
    let mut xs = Vec::with_capacity(t_max);
    let mut ys = Vec::with_capacity(t_max);
    for t in 1..=t_max {
        x = spec.b() * &x + draw(&mut rng, &l_q);
        let y = spec.z(t) * &x + draw(&mut rng, &l_r);
        xs.push(x.clone());
        ys.push(y);
    }
    Ok(Simulation { xs, ys })
}
