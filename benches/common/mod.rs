#![allow(dead_code)]

use nested_tape::Scalar;

fn lift<T: Scalar>(v: f64) -> T {
    T::from_f(<T::Float as num_traits::FromPrimitive>::from_f64(v).unwrap())
}

// ─── Rosenbrock ────────────────────────────────────────────────────────────

pub fn rosenbrock<T: Scalar>(x: &[T]) -> T {
    let one = lift::<T>(1.0);
    let hundred = lift::<T>(100.0);
    let mut sum = T::zero();
    for i in 0..x.len() - 1 {
        let t1 = one - x[i];
        let t2 = x[i + 1] - x[i] * x[i];
        sum = sum + t1 * t1 + hundred * t2 * t2;
    }
    sum
}

// ─── Neural Network Unit ───────────────────────────────────────────────────
// f(x) = sigmoid(Σ_i w_i·x_i + b), deterministic weights w_i = sin(i+1)/(n+1).
// One call per output of the map; exercises exp/add/mul.

pub fn nn_unit<T: Scalar>(x: &[T], unit: usize) -> T {
    let n = x.len();
    let one = T::one();
    let scale = 1.0 / (n as f64 + 1.0);
    let mut z = lift::<T>(0.1 * (unit as f64 + 1.0));
    for (i, &xi) in x.iter().enumerate() {
        let w = ((unit * n + i + 1) as f64).sin() * scale;
        z = z + lift::<T>(w) * xi;
    }
    one / (one + (-z).exp())
}

// ─── Helpers ───────────────────────────────────────────────────────────────

pub fn make_input(n: usize) -> Vec<f64> {
    (0..n).map(|i| 0.5 + 0.01 * i as f64).collect()
}
