//! Entropic optimal transport: full Sinkhorn scaling and greedy Greenkhorn.
//!
//! Both kernels take marginals `a` (length n), `b` (length m), a cost matrix
//! `C` (n × m) and a regularization `epsilon > 0`, and return the transport
//! plan, its cost, and convergence diagnostics.

use serde_json::{json, Map, Value};

use crate::executor::{ExecutionContext, KernelError, OperatorKernel};
use crate::operator::DeterminismTier;

const ENTROPIC_MAX_ITER: u64 = 1_000;
const GREENKHORN_MAX_ITER: u64 = 10_000;
const DEFAULT_TOL: f64 = 1e-9;

/// `op://sinkhorn_entropic.0`
#[derive(Debug, Default, Clone, Copy)]
pub struct SinkhornEntropic;

/// `op://sinkhorn_greenkhorn.0`
///
/// Accepts `accelerated` and `momentum`; when accelerated, each scaling
/// step is over-relaxed by `1 + momentum`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SinkhornGreenkhorn;

/// Validated problem data shared by both solvers.
#[derive(Debug)]
struct Problem {
    a: Vec<f64>,
    b: Vec<f64>,
    cost: Vec<Vec<f64>>,
    kernel: Vec<Vec<f64>>,
    max_iter: u64,
    tol: f64,
}

impl Problem {
    fn from_params(
        params: &Map<String, Value>,
        default_max_iter: u64,
    ) -> Result<Self, KernelError> {
        let a = parse_vector(params, "a")?;
        let b = parse_vector(params, "b")?;
        let cost = parse_matrix(params, "C")?;
        let epsilon = required_f64(params, "epsilon")?;

        if !(epsilon > 0.0 && epsilon.is_finite()) {
            return Err(KernelError::InvalidInput(format!(
                "epsilon must be positive and finite, got {epsilon}"
            )));
        }
        if cost.len() != a.len() || cost.iter().any(|row| row.len() != b.len()) {
            return Err(KernelError::InvalidInput(format!(
                "C must be {}x{} to match a and b",
                a.len(),
                b.len()
            )));
        }
        if a.iter().chain(&b).any(|x| *x < 0.0) {
            return Err(KernelError::InvalidInput("marginals must be non-negative".into()));
        }

        let max_iter = match params.get("max_iter") {
            None => default_max_iter,
            Some(v) => v
                .as_u64()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    KernelError::InvalidInput("max_iter must be a positive integer".into())
                })?,
        };
        let tol = optional_f64(params, "tol")?.unwrap_or(DEFAULT_TOL);

        let kernel = cost
            .iter()
            .map(|row| row.iter().map(|c| (-c / epsilon).exp()).collect())
            .collect();

        Ok(Self {
            a,
            b,
            cost,
            kernel,
            max_iter,
            tol,
        })
    }

    fn plan(&self, u: &[f64], v: &[f64]) -> Vec<Vec<f64>> {
        self.kernel
            .iter()
            .zip(u)
            .map(|(row, ui)| row.iter().zip(v).map(|(k, vj)| ui * k * vj).collect())
            .collect()
    }

    /// L1 distance of the plan's row and column sums from `a` and `b`.
    fn marginal_error(&self, plan: &[Vec<f64>]) -> f64 {
        let rows: f64 = plan
            .iter()
            .zip(&self.a)
            .map(|(row, ai)| (row.iter().sum::<f64>() - ai).abs())
            .sum();
        let cols: f64 = (0..self.b.len())
            .map(|j| (plan.iter().map(|row| row[j]).sum::<f64>() - self.b[j]).abs())
            .sum();
        rows + cols
    }

    fn finish(
        &self,
        u: &[f64],
        v: &[f64],
        iterations: u64,
    ) -> Result<Map<String, Value>, KernelError> {
        let plan = self.plan(u, v);
        let cost: f64 = plan
            .iter()
            .zip(&self.cost)
            .flat_map(|(p_row, c_row)| p_row.iter().zip(c_row).map(|(p, c)| p * c))
            .sum();
        if !cost.is_finite() || plan.iter().flatten().any(|p| !p.is_finite()) {
            return Err(KernelError::Numerical(
                "transport plan is not finite; try a larger epsilon".into(),
            ));
        }
        let marginal_error = self.marginal_error(&plan);

        let mut out = Map::new();
        out.insert("transport_plan".into(), json!(plan));
        out.insert("cost".into(), json!(cost));
        out.insert(
            "diagnostics".into(),
            json!({
                "iterations": iterations,
                "marginal_error": marginal_error,
                "converged": marginal_error <= self.tol,
            }),
        );
        Ok(out)
    }
}

impl OperatorKernel for SinkhornEntropic {
    fn tier(&self) -> DeterminismTier {
        DeterminismTier::D0
    }

    fn run(
        &self,
        params: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, KernelError> {
        let problem = Problem::from_params(params, ENTROPIC_MAX_ITER)?;
        let (n, m) = (problem.a.len(), problem.b.len());
        let mut u = vec![1.0; n];
        let mut v = vec![1.0; m];

        let mut iterations = 0;
        while iterations < problem.max_iter {
            ctx.check_cancelled()?;
            iterations += 1;

            for i in 0..n {
                let kv: f64 = problem.kernel[i].iter().zip(&v).map(|(k, vj)| k * vj).sum();
                u[i] = safe_ratio(problem.a[i], kv)?;
            }
            for j in 0..m {
                let ktu: f64 = (0..n).map(|i| problem.kernel[i][j] * u[i]).sum();
                v[j] = safe_ratio(problem.b[j], ktu)?;
            }

            if problem.marginal_error(&problem.plan(&u, &v)) <= problem.tol {
                break;
            }
        }
        problem.finish(&u, &v, iterations)
    }
}

impl OperatorKernel for SinkhornGreenkhorn {
    fn tier(&self) -> DeterminismTier {
        DeterminismTier::D0
    }

    fn run(
        &self,
        params: &Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<Map<String, Value>, KernelError> {
        let problem = Problem::from_params(params, GREENKHORN_MAX_ITER)?;
        let accelerated = params.get("accelerated").and_then(Value::as_bool).unwrap_or(false);
        let momentum = optional_f64(params, "momentum")?.unwrap_or(0.0);
        if !(0.0..1.0).contains(&momentum) {
            return Err(KernelError::InvalidInput(format!(
                "momentum must be in [0, 1), got {momentum}"
            )));
        }
        let omega = if accelerated { 1.0 + momentum } else { 1.0 };

        let (n, m) = (problem.a.len(), problem.b.len());
        let mut u = vec![1.0; n];
        let mut v = vec![1.0; m];

        let mut iterations = 0;
        while iterations < problem.max_iter {
            ctx.check_cancelled()?;

            let plan = problem.plan(&u, &v);
            if problem.marginal_error(&plan) <= problem.tol {
                break;
            }
            iterations += 1;

            let rows: Vec<f64> = plan.iter().map(|row| row.iter().sum()).collect();
            let cols: Vec<f64> = (0..m).map(|j| plan.iter().map(|row| row[j]).sum()).collect();
            let (i, row_gap) = worst(&problem.a, &rows);
            let (j, col_gap) = worst(&problem.b, &cols);

            if row_gap >= col_gap {
                let kv: f64 = problem.kernel[i].iter().zip(&v).map(|(k, vj)| k * vj).sum();
                u[i] = relax(u[i], safe_ratio(problem.a[i], kv)?, omega);
            } else {
                let ktu: f64 = (0..n).map(|r| problem.kernel[r][j] * u[r]).sum();
                v[j] = relax(v[j], safe_ratio(problem.b[j], ktu)?, omega);
            }
        }
        problem.finish(&u, &v, iterations)
    }
}

/// Index and gap of the coordinate furthest from its target marginal.
fn worst(target: &[f64], actual: &[f64]) -> (usize, f64) {
    target
        .iter()
        .zip(actual)
        .map(|(x, y)| bregman_gap(*x, *y))
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (idx, gap)| {
            if gap > best.1 {
                (idx, gap)
            } else {
                best
            }
        })
}

/// `y - x + x ln(x / y)`: the KL-style gap Greenkhorn uses to pick a coordinate.
fn bregman_gap(x: f64, y: f64) -> f64 {
    if x == 0.0 {
        y
    } else if y == 0.0 {
        f64::INFINITY
    } else {
        y - x + x * (x / y).ln()
    }
}

/// Over-relaxed update `current^(1-ω) · target^ω`; `ω = 1` is the plain step.
fn relax(current: f64, target: f64, omega: f64) -> f64 {
    if omega == 1.0 || current == 0.0 || target == 0.0 {
        target
    } else {
        current.powf(1.0 - omega) * target.powf(omega)
    }
}

fn safe_ratio(num: f64, den: f64) -> Result<f64, KernelError> {
    if num == 0.0 {
        return Ok(0.0);
    }
    if den <= 0.0 || !den.is_finite() {
        return Err(KernelError::Numerical(
            "kernel matrix underflowed; try a larger epsilon".into(),
        ));
    }
    Ok(num / den)
}

fn required_f64(params: &Map<String, Value>, key: &str) -> Result<f64, KernelError> {
    optional_f64(params, key)?.ok_or_else(|| KernelError::InvalidInput(format!("missing `{key}`")))
}

fn optional_f64(params: &Map<String, Value>, key: &str) -> Result<Option<f64>, KernelError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| KernelError::InvalidInput(format!("`{key}` must be a number"))),
    }
}

/// A non-empty array of finite numbers.
pub(crate) fn parse_vector(
    params: &Map<String, Value>,
    key: &str,
) -> Result<Vec<f64>, KernelError> {
    let arr = params
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| KernelError::InvalidInput(format!("`{key}` must be an array of numbers")))?;
    if arr.is_empty() {
        return Err(KernelError::InvalidInput(format!("`{key}` must not be empty")));
    }
    arr.iter()
        .map(|v| {
            v.as_f64()
                .filter(|x| x.is_finite())
                .ok_or_else(|| KernelError::InvalidInput(format!("`{key}` contains a non-number")))
        })
        .collect()
}

/// A non-empty rectangular array of arrays of finite numbers.
pub(crate) fn parse_matrix(
    params: &Map<String, Value>,
    key: &str,
) -> Result<Vec<Vec<f64>>, KernelError> {
    let rows = params
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| KernelError::InvalidInput(format!("`{key}` must be a matrix")))?;

    let mut matrix = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let mut wrapped = Map::new();
        wrapped.insert(key.to_string(), row.clone());
        let parsed = parse_vector(&wrapped, key).map_err(|_| {
            KernelError::InvalidInput(format!("`{key}` row {i} is not an array of numbers"))
        })?;
        matrix.push(parsed);
    }
    if matrix.is_empty() {
        return Err(KernelError::InvalidInput(format!("`{key}` must not be empty")));
    }
    let width = matrix[0].len();
    if matrix.iter().any(|row| row.len() != width) {
        return Err(KernelError::InvalidInput(format!("`{key}` rows differ in length")));
    }
    Ok(matrix)
}
