//! A small training demo: fits the transition distribution of a 2D linear-Gaussian state-space
//! model by gradient ascent on the particle estimate of the log-evidence, then compares the
//! result with the exact Kalman log-likelihood.

use burn::backend::{Autodiff, NdArray};
use burn::optim::{GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use mini_smc::distributions::MvNormal;
use mini_smc::kalman::LinearGaussianModel;
use mini_smc::smc::{Smc, SmcConfig};
use mini_smc::transformations::LinearTransformation;
use nalgebra as na;
use ndarray::{arr2, Array2};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use std::error::Error;

type BackendType = Autodiff<NdArray>;

/// Main entry point: simulates a dataset, trains `A` and reports the fit.
fn main() -> Result<(), Box<dyn Error>> {
    const N_SEQUENCES: usize = 8;
    const T_LEN: usize = 30;
    const N_PARTICLES: usize = 100;
    const ITERATIONS: usize = 40;
    const LEARNING_RATE: f64 = 2e-3;
    const SEED: u64 = 42;

    let truth = LinearGaussianModel::new(
        na::DMatrix::from_diagonal(&na::DVector::from_vec(vec![0.95, 0.25])),
        na::DMatrix::identity(2, 2),
        na::DMatrix::from_diagonal(&na::DVector::from_vec(vec![1.0, 2.0])),
        na::DMatrix::identity(2, 2),
        na::DVector::from_vec(vec![0.0, 0.0]),
        na::DMatrix::identity(2, 2),
    )?;

    // Dataset
    let mut rng = SmallRng::seed_from_u64(SEED);
    let mut flat = Vec::with_capacity(N_SEQUENCES * T_LEN * 2);
    let mut exact = 0.0;
    for _ in 0..N_SEQUENCES {
        let (_, obs) = truth.simulate(T_LEN, &mut rng)?;
        exact += truth.log_likelihood(&obs)?;
        flat.extend(obs.iter().flat_map(|y| y.iter().map(|&v| v as f32)));
    }
    exact /= N_SEQUENCES as f64;
    let device = Default::default();
    let obs = Tensor::<BackendType, 3>::from_data(
        TensorData::new(flat, [N_SEQUENCES, T_LEN, 2]),
        &device,
    );
    println!("Simulated {N_SEQUENCES} sequences of length {T_LEN}");
    println!("Mean exact log-likelihood: {exact:.3}");

    // Model with a wrong initial guess for A
    let mut f = MvNormal::new(
        LinearTransformation::<BackendType>::from_array(&arr2(&[[0.5, 0.0], [0.0, 0.5]]), &device),
        &Array2::eye(2),
        1e-3,
        &device,
    )?
    .with_initial_location(&[0.0, 0.0], &device)?;
    let g = MvNormal::new(
        LinearTransformation::<BackendType>::from_array(&arr2(&[[1.0, 0.0], [0.0, 2.0]]), &device),
        &Array2::eye(2),
        1e-3,
        &device,
    )?;
    let config = SmcConfig::new(N_PARTICLES);

    let mut optim =
        SgdConfig::new().init::<BackendType, MvNormal<BackendType, LinearTransformation<BackendType>>>();
    for iteration in 0..ITERATIONS {
        let grads = {
            let smc = Smc::bootstrap(&f, &g, config.clone())?;
            let out = smc.run(obs.clone(), None, &mut rng)?;
            if iteration % 10 == 0 {
                let mean = out.log_evidence_values().iter().sum::<f32>() / N_SEQUENCES as f32;
                println!("Iteration {iteration:3}: mean log Z = {mean:.3}");
            }
            GradientsParams::from_grads(out.loss().backward(), &f)
        };
        f = optim.step(LEARNING_RATE, f, grads);
    }

    let a: Vec<f32> = f.transformation.weight.val().into_data().iter::<f32>().collect();
    println!("Learned A: [[{:.3}, {:.3}], [{:.3}, {:.3}]]", a[0], a[1], a[2], a[3]);
    println!("True A:    [[0.950, 0.000], [0.000, 0.250]]");

    let smc = Smc::bootstrap(&f, &g, SmcConfig::new(1000))?;
    let final_mean = smc.evaluate_progress(obs.clone(), None, 4, &mut rng)?;
    println!("Final mean log Z: {final_mean:.3} (exact {exact:.3})");

    let out = smc.run(obs.clone(), None, &mut rng)?;
    for e in smc.k_step_mse(&out, obs, 3)? {
        println!("{}-step prediction: MSE {:.3}, R² {:.3}", e.k, e.mse, e.r_squared);
    }
    Ok(())
}

#[test]
fn test_main() {
    main().expect("Expected main to not return an error.");
}
