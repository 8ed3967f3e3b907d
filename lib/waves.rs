//! Initial-guess waveforms.

use ndarray::{ self as nd };
use rand::Rng;

/// Smooth random waveform built from `n_modes` random-amplitude half-sine
/// modes per control, so every row starts and ends near zero and contains no
/// structure faster than mode `n_modes`.
pub fn random_waves<R>(
    n_ctrls: usize,
    plen: usize,
    amp: f64,
    n_modes: usize,
    rng: &mut R,
) -> nd::Array2<f64>
where R: Rng + ?Sized
{
    let norm = amp / (n_modes.max(1) as f64).sqrt();
    let mut waves: nd::Array2<f64> = nd::Array2::zeros((n_ctrls, plen));
    for mut row in waves.rows_mut() {
        let amps: Vec<f64>
            = (0..n_modes).map(|_| rng.gen_range(-1.0..1.0)).collect();
        for (t, w) in row.iter_mut().enumerate() {
            let x = (t as f64 + 0.5) / plen as f64;
            *w = norm * amps.iter().enumerate()
                .map(|(m, a)| {
                    a * (std::f64::consts::PI * (m + 1) as f64 * x).sin()
                })
                .sum::<f64>();
        }
    }
    waves
}

/// Flat waveform at a fixed amplitude.
pub fn constant_waves(n_ctrls: usize, plen: usize, value: f64)
    -> nd::Array2<f64>
{
    nd::Array2::from_elem((n_ctrls, plen), value)
}
