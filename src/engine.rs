//! Numeric compute engine.
//!
//! The trainer only talks to `ComputeEngine`; it never looks at how an op is
//! carried out. `CpuEngine` is the host implementation: `matrixmultiply` for
//! GEMM and rayon for large elementwise loops.

use rayon::prelude::*;

use crate::error::{LstmError, Result};
use crate::optimizer::AdamConfig;
use crate::tensor::{Shape, Tensor};

/// Operand layout for `matmul`: `out (+)= op(a) @ op(b)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MatMul {
    pub transpose_a: bool,
    pub transpose_b: bool,
    /// Add into `out` instead of overwriting it.
    pub accumulate: bool,
}

impl MatMul {
    pub const PLAIN: MatMul = MatMul { transpose_a: false, transpose_b: false, accumulate: false };

    pub fn accumulate(mut self) -> Self {
        self.accumulate = true;
        self
    }

    pub fn transpose_a(mut self) -> Self {
        self.transpose_a = true;
        self
    }

    pub fn transpose_b(mut self) -> Self {
        self.transpose_b = true;
        self
    }
}

pub trait ComputeEngine: Send + Sync {
    /// Zero-filled tensor. Allocation failure is `ResourceExhausted`.
    fn allocate(&self, shape: &Shape) -> Result<Tensor>;
    fn from_host(&self, data: Vec<f32>, shape: Shape) -> Result<Tensor>;
    fn to_host(&self, t: &Tensor) -> Vec<f32>;
    /// Block until every previously issued op has completed.
    fn synchronize(&self) {}

    fn fill(&self, t: &mut Tensor, value: f32);
    fn copy(&self, src: &Tensor, dst: &mut Tensor) -> Result<()>;

    fn matmul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor, op: MatMul) -> Result<()>;
    fn add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;
    fn subtract(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;
    fn multiply(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()>;
    /// `dst += src`, the gradient accumulation primitive.
    fn accumulate(&self, dst: &mut Tensor, src: &Tensor) -> Result<()>;

    fn sigmoid(&self, x: &Tensor, out: &mut Tensor) -> Result<()>;
    /// `s * (1 - s)` where `s` is already a sigmoid output.
    fn sigmoid_derivative(&self, s: &Tensor, out: &mut Tensor) -> Result<()>;
    fn tanh(&self, x: &Tensor, out: &mut Tensor) -> Result<()>;
    /// `1 - t^2` where `t` is already a tanh output.
    fn tanh_derivative(&self, t: &Tensor, out: &mut Tensor) -> Result<()>;
    /// Row-wise softmax.
    fn softmax(&self, x: &Tensor, out: &mut Tensor) -> Result<()>;

    fn scale(&self, t: &mut Tensor, s: f32);
    fn clip(&self, t: &mut Tensor, lo: f32, hi: f32);

    /// Copy row `row` of `table` into `out` (embedding lookup).
    fn lookup(&self, table: &Tensor, row: usize, out: &mut Tensor) -> Result<()>;
    /// `table[row] += src`.
    fn accumulate_row(&self, table: &mut Tensor, row: usize, src: &Tensor) -> Result<()>;
    fn one_hot(&self, index: usize, out: &mut Tensor) -> Result<()>;

    fn sum_squares(&self, t: &Tensor) -> f64;
    fn all_finite(&self, t: &Tensor) -> bool;

    /// Fused bias-corrected Adam step over `params`, `m`, `v` in place.
    /// `step` is the 1-based update count for this parameter.
    fn adam_update(
        &self,
        params: &mut Tensor,
        grad: &Tensor,
        m: &mut Tensor,
        v: &mut Tensor,
        hp: &AdamConfig,
        step: u64,
    ) -> Result<()>;
}

/// Host engine. Loops longer than `parallel_threshold` go through rayon.
#[derive(Clone, Debug)]
pub struct CpuEngine {
    parallel_threshold: usize,
}

impl Default for CpuEngine {
    fn default() -> Self {
        CpuEngine { parallel_threshold: 1 << 15 }
    }
}

impl CpuEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallel_threshold(parallel_threshold: usize) -> Self {
        CpuEngine { parallel_threshold: parallel_threshold.max(1) }
    }

    fn map_into(&self, a: &[f32], out: &mut [f32], f: impl Fn(f32) -> f32 + Sync + Send) {
        if out.len() >= self.parallel_threshold {
            out.par_iter_mut().zip(a.par_iter()).for_each(|(o, &x)| *o = f(x));
        } else {
            for (o, &x) in out.iter_mut().zip(a.iter()) { *o = f(x); }
        }
    }

    fn zip_into(&self, a: &[f32], b: &[f32], out: &mut [f32], f: impl Fn(f32, f32) -> f32 + Sync + Send) {
        if out.len() >= self.parallel_threshold {
            out.par_iter_mut()
                .zip(a.par_iter().zip(b.par_iter()))
                .for_each(|(o, (&x, &y))| *o = f(x, y));
        } else {
            for (o, (&x, &y)) in out.iter_mut().zip(a.iter().zip(b.iter())) { *o = f(x, y); }
        }
    }

    fn map_inplace(&self, a: &mut [f32], f: impl Fn(f32) -> f32 + Sync + Send) {
        if a.len() >= self.parallel_threshold {
            a.par_iter_mut().for_each(|x| *x = f(*x));
        } else {
            for x in a.iter_mut() { *x = f(*x); }
        }
    }
}

fn same_shape(op: &str, a: &Shape, b: &Shape) -> Result<()> {
    if a != b {
        return Err(LstmError::shape_mismatch(format!("{} {} vs {}", op, a, b), a.len(), b.len()));
    }
    Ok(())
}

#[inline]
fn sigmoid_scalar(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
fn vec_max(a: &[f32]) -> f32 {
    a.iter().cloned().fold(f32::NEG_INFINITY, f32::max)
}

impl ComputeEngine for CpuEngine {
    fn allocate(&self, shape: &Shape) -> Result<Tensor> {
        let n = shape.len();
        let mut data: Vec<f32> = Vec::new();
        data.try_reserve_exact(n)
            .map_err(|_| LstmError::ResourceExhausted { shape: shape.clone(), elements: n })?;
        data.resize(n, 0.0);
        Tensor::from_vec(data, shape.clone())
    }

    fn from_host(&self, data: Vec<f32>, shape: Shape) -> Result<Tensor> {
        Tensor::from_vec(data, shape)
    }

    fn to_host(&self, t: &Tensor) -> Vec<f32> {
        t.as_slice().to_vec()
    }

    fn fill(&self, t: &mut Tensor, value: f32) {
        t.as_mut_slice().fill(value);
    }

    fn copy(&self, src: &Tensor, dst: &mut Tensor) -> Result<()> {
        same_shape("copy", src.shape(), dst.shape())?;
        dst.as_mut_slice().copy_from_slice(src.as_slice());
        Ok(())
    }

    fn matmul(&self, a: &Tensor, b: &Tensor, out: &mut Tensor, op: MatMul) -> Result<()> {
        let (m, k) = if op.transpose_a { (a.cols(), a.rows()) } else { (a.rows(), a.cols()) };
        let (kb, n) = if op.transpose_b { (b.cols(), b.rows()) } else { (b.rows(), b.cols()) };
        if k != kb {
            return Err(LstmError::shape_mismatch(
                format!("matmul inner dimension {} @ {}", a.shape(), b.shape()),
                k,
                kb,
            ));
        }
        if out.rows() != m || out.cols() != n {
            return Err(LstmError::shape_mismatch(
                format!("matmul output {} for [{}, {}]", out.shape(), m, n),
                m * n,
                out.len(),
            ));
        }
        // Transposition is expressed purely through strides.
        let (rsa, csa) = if op.transpose_a { (1, m as isize) } else { (k as isize, 1) };
        let (rsb, csb) = if op.transpose_b { (1, k as isize) } else { (n as isize, 1) };
        let beta = if op.accumulate { 1.0 } else { 0.0 };
        // SAFETY: all three buffers were checked against m, k, n above and the
        // strides stay inside them.
        unsafe {
            matrixmultiply::sgemm(
                m, k, n,
                1.0,
                a.as_slice().as_ptr(), rsa, csa,
                b.as_slice().as_ptr(), rsb, csb,
                beta,
                out.as_mut_slice().as_mut_ptr(), n as isize, 1,
            );
        }
        Ok(())
    }

    fn add(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        same_shape("add", a.shape(), b.shape())?;
        same_shape("add", a.shape(), out.shape())?;
        self.zip_into(a.as_slice(), b.as_slice(), out.as_mut_slice(), |x, y| x + y);
        Ok(())
    }

    fn subtract(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        same_shape("subtract", a.shape(), b.shape())?;
        same_shape("subtract", a.shape(), out.shape())?;
        self.zip_into(a.as_slice(), b.as_slice(), out.as_mut_slice(), |x, y| x - y);
        Ok(())
    }

    fn multiply(&self, a: &Tensor, b: &Tensor, out: &mut Tensor) -> Result<()> {
        same_shape("multiply", a.shape(), b.shape())?;
        same_shape("multiply", a.shape(), out.shape())?;
        self.zip_into(a.as_slice(), b.as_slice(), out.as_mut_slice(), |x, y| x * y);
        Ok(())
    }

    fn accumulate(&self, dst: &mut Tensor, src: &Tensor) -> Result<()> {
        same_shape("accumulate", dst.shape(), src.shape())?;
        let s = src.as_slice();
        let d = dst.as_mut_slice();
        if d.len() >= self.parallel_threshold {
            d.par_iter_mut().zip(s.par_iter()).for_each(|(x, y)| *x += y);
        } else {
            for (x, y) in d.iter_mut().zip(s.iter()) { *x += y; }
        }
        Ok(())
    }

    fn sigmoid(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        same_shape("sigmoid", x.shape(), out.shape())?;
        self.map_into(x.as_slice(), out.as_mut_slice(), sigmoid_scalar);
        Ok(())
    }

    fn sigmoid_derivative(&self, s: &Tensor, out: &mut Tensor) -> Result<()> {
        same_shape("sigmoid_derivative", s.shape(), out.shape())?;
        self.map_into(s.as_slice(), out.as_mut_slice(), |s| s * (1.0 - s));
        Ok(())
    }

    fn tanh(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        same_shape("tanh", x.shape(), out.shape())?;
        self.map_into(x.as_slice(), out.as_mut_slice(), f32::tanh);
        Ok(())
    }

    fn tanh_derivative(&self, t: &Tensor, out: &mut Tensor) -> Result<()> {
        same_shape("tanh_derivative", t.shape(), out.shape())?;
        self.map_into(t.as_slice(), out.as_mut_slice(), |t| 1.0 - t * t);
        Ok(())
    }

    fn softmax(&self, x: &Tensor, out: &mut Tensor) -> Result<()> {
        same_shape("softmax", x.shape(), out.shape())?;
        let cols = x.cols();
        for (row_in, row_out) in x.as_slice().chunks(cols).zip(out.as_mut_slice().chunks_mut(cols)) {
            let max_l = vec_max(row_in);
            let mut sum = 0.0f32;
            for (o, &v) in row_out.iter_mut().zip(row_in.iter()) {
                *o = (v - max_l).exp();
                sum += *o;
            }
            let inv = 1.0 / sum;
            for o in row_out.iter_mut() { *o *= inv; }
        }
        Ok(())
    }

    fn scale(&self, t: &mut Tensor, s: f32) {
        self.map_inplace(t.as_mut_slice(), |x| x * s);
    }

    fn clip(&self, t: &mut Tensor, lo: f32, hi: f32) {
        self.map_inplace(t.as_mut_slice(), |x| x.clamp(lo, hi));
    }

    fn lookup(&self, table: &Tensor, row: usize, out: &mut Tensor) -> Result<()> {
        let cols = table.cols();
        if row >= table.rows() {
            return Err(LstmError::not_found("table row", format!("{} of {}", row, table.shape())));
        }
        if out.len() != cols {
            return Err(LstmError::shape_mismatch(format!("lookup into {}", out.shape()), cols, out.len()));
        }
        let off = row * cols;
        out.as_mut_slice().copy_from_slice(&table.as_slice()[off..off + cols]);
        Ok(())
    }

    fn accumulate_row(&self, table: &mut Tensor, row: usize, src: &Tensor) -> Result<()> {
        let cols = table.cols();
        if row >= table.rows() {
            return Err(LstmError::not_found("table row", format!("{} of {}", row, table.shape())));
        }
        if src.len() != cols {
            return Err(LstmError::shape_mismatch(format!("row accumulate from {}", src.shape()), cols, src.len()));
        }
        let off = row * cols;
        for (d, s) in table.as_mut_slice()[off..off + cols].iter_mut().zip(src.as_slice()) {
            *d += s;
        }
        Ok(())
    }

    fn one_hot(&self, index: usize, out: &mut Tensor) -> Result<()> {
        if index >= out.len() {
            return Err(LstmError::not_found("one-hot index", format!("{} of {}", index, out.shape())));
        }
        let d = out.as_mut_slice();
        d.fill(0.0);
        d[index] = 1.0;
        Ok(())
    }

    fn sum_squares(&self, t: &Tensor) -> f64 {
        let d = t.as_slice();
        if d.len() >= self.parallel_threshold {
            d.par_iter().map(|&x| (x as f64) * (x as f64)).sum()
        } else {
            d.iter().map(|&x| (x as f64) * (x as f64)).sum()
        }
    }

    fn all_finite(&self, t: &Tensor) -> bool {
        let d = t.as_slice();
        if d.len() >= self.parallel_threshold {
            d.par_iter().all(|x| x.is_finite())
        } else {
            d.iter().all(|x| x.is_finite())
        }
    }

    fn adam_update(
        &self,
        params: &mut Tensor,
        grad: &Tensor,
        m: &mut Tensor,
        v: &mut Tensor,
        hp: &AdamConfig,
        step: u64,
    ) -> Result<()> {
        same_shape("adam_update grad", params.shape(), grad.shape())?;
        same_shape("adam_update m", params.shape(), m.shape())?;
        same_shape("adam_update v", params.shape(), v.shape())?;
        let t = step.max(1) as i32;
        let bc1 = 1.0 - hp.beta1.powi(t);
        let bc2 = 1.0 - hp.beta2.powi(t);
        let (lr, b1, b2, eps, wd) = (hp.learning_rate, hp.beta1, hp.beta2, hp.epsilon, hp.weight_decay);

        let update = |(((p, m), v), &g): (((&mut f32, &mut f32), &mut f32), &f32)| {
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            let m_hat = *m / bc1;
            let v_hat = *v / bc2;
            *p -= lr * wd * *p + lr * m_hat / (v_hat.sqrt() + eps);
        };

        let p = params.as_mut_slice();
        if p.len() >= self.parallel_threshold {
            p.par_iter_mut()
                .zip(m.as_mut_slice().par_iter_mut())
                .zip(v.as_mut_slice().par_iter_mut())
                .zip(grad.as_slice().par_iter())
                .for_each(update);
        } else {
            p.iter_mut()
                .zip(m.as_mut_slice().iter_mut())
                .zip(v.as_mut_slice().iter_mut())
                .zip(grad.as_slice().iter())
                .for_each(update);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(engine: &CpuEngine, data: &[f32], rows: usize, cols: usize) -> Tensor {
        engine.from_host(data.to_vec(), Shape::matrix(rows, cols)).unwrap()
    }

    #[test]
    fn matmul_handles_transposes_and_accumulation() {
        let e = CpuEngine::new();
        let a = t(&e, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 2, 3);
        let b = t(&e, &[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], 3, 2);
        let mut out = e.allocate(&Shape::matrix(2, 2)).unwrap();
        e.matmul(&a, &b, &mut out, MatMul::PLAIN).unwrap();
        assert_eq!(out.as_slice(), &[4.0, 5.0, 10.0, 11.0]);

        // a^T @ a : [3,2] @ [2,3]
        let mut ata = e.allocate(&Shape::matrix(3, 3)).unwrap();
        e.matmul(&a, &a, &mut ata, MatMul::PLAIN.transpose_a()).unwrap();
        assert_eq!(ata.as_slice(), &[17.0, 22.0, 27.0, 22.0, 29.0, 36.0, 27.0, 36.0, 45.0]);

        // a @ a^T accumulated twice
        let mut aat = e.allocate(&Shape::matrix(2, 2)).unwrap();
        e.matmul(&a, &a, &mut aat, MatMul::PLAIN.transpose_b()).unwrap();
        e.matmul(&a, &a, &mut aat, MatMul::PLAIN.transpose_b().accumulate()).unwrap();
        assert_eq!(aat.as_slice(), &[28.0, 64.0, 64.0, 154.0]);
    }

    #[test]
    fn matmul_rejects_bad_inner_dimension() {
        let e = CpuEngine::new();
        let a = t(&e, &[1.0; 6], 2, 3);
        let mut out = e.allocate(&Shape::matrix(2, 2)).unwrap();
        let err = e.matmul(&a, &a, &mut out, MatMul::PLAIN).unwrap_err();
        assert!(matches!(err, LstmError::ShapeMismatch { .. }));
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let e = CpuEngine::new();
        let x = t(&e, &[1.0, 2.0, 3.0, 1000.0, 1000.0, 1000.0], 2, 3);
        let mut p = e.allocate(x.shape()).unwrap();
        e.softmax(&x, &mut p).unwrap();
        for row in p.as_slice().chunks(3) {
            let s: f32 = row.iter().sum();
            assert!((s - 1.0).abs() < 1e-6);
        }
        assert!((p.as_slice()[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn parallel_and_serial_paths_agree() {
        let serial = CpuEngine::with_parallel_threshold(usize::MAX);
        let parallel = CpuEngine::with_parallel_threshold(1);
        let data: Vec<f32> = (0..257).map(|i| (i as f32 * 0.37).sin()).collect();
        let x = t(&serial, &data, 1, 257);
        let mut a = serial.allocate(x.shape()).unwrap();
        let mut b = serial.allocate(x.shape()).unwrap();
        serial.sigmoid(&x, &mut a).unwrap();
        parallel.sigmoid(&x, &mut b).unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
        assert!((serial.sum_squares(&x) - parallel.sum_squares(&x)).abs() < 1e-9);
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let e = CpuEngine::new();
        let hp = AdamConfig::default();
        let mut p = t(&e, &[1.0, -1.0], 1, 2);
        let g = t(&e, &[0.5, -2.0], 1, 2);
        let mut m = e.allocate(p.shape()).unwrap();
        let mut v = e.allocate(p.shape()).unwrap();
        e.adam_update(&mut p, &g, &mut m, &mut v, &hp, 1).unwrap();
        // With bias correction the first step is ~lr * sign(g).
        assert!((p.as_slice()[0] - (1.0 - hp.learning_rate)).abs() < 1e-5);
        assert!((p.as_slice()[1] - (-1.0 + hp.learning_rate)).abs() < 1e-5);
        assert!((m.as_slice()[0] - 0.05).abs() < 1e-7);
    }

    #[test]
    fn lookup_and_accumulate_row() {
        let e = CpuEngine::new();
        let mut table = t(&e, &[0.0, 1.0, 2.0, 3.0, 4.0, 5.0], 3, 2);
        let mut row = e.allocate(&Shape::matrix(1, 2)).unwrap();
        e.lookup(&table, 2, &mut row).unwrap();
        assert_eq!(row.as_slice(), &[4.0, 5.0]);
        e.accumulate_row(&mut table, 0, &row).unwrap();
        assert_eq!(&table.as_slice()[..2], &[4.0, 6.0]);
        assert!(e.lookup(&table, 3, &mut row).is_err());
    }
}
