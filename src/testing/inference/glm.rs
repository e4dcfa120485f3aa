//! Generalized linear models fitted by iteratively reweighted least squares.
//!
//! Shared by the count GLM tests, logistic regression, the hurdle model and the
//! size-factor model. Designs are small (intercept, one group or feature
//! column, a handful of covariates), so every solve goes through a dense
//! Cholesky factorization of `X'WX`.

use anyhow::{Result, anyhow, bail};
use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::Array2;
use statrs::function::gamma::ln_gamma;

const MU_EPS: f64 = 1e-10;
const THETA_LN_BOUNDS: (f64, f64) = (-9.0, 11.5);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Family {
    Poisson,
    /// NB2 with variance `mu + mu^2 / theta`.
    NegativeBinomial { theta: f64 },
    Binomial,
    Gaussian,
    /// Identity link, variance `mu^2`.
    Gamma,
}

impl Family {
    fn link_inverse(&self, eta: f64) -> f64 {
        match self {
            Family::Poisson | Family::NegativeBinomial { .. } => eta.clamp(-700.0, 700.0).exp(),
            Family::Binomial => (1.0 / (1.0 + (-eta).exp())).clamp(MU_EPS, 1.0 - MU_EPS),
            Family::Gaussian | Family::Gamma => eta,
        }
    }

    fn link(&self, mu: f64) -> f64 {
        match self {
            Family::Poisson | Family::NegativeBinomial { .. } => mu.ln(),
            Family::Binomial => (mu / (1.0 - mu)).ln(),
            Family::Gaussian | Family::Gamma => mu,
        }
    }

    /// d mu / d eta
    fn mu_eta(&self, mu: f64) -> f64 {
        match self {
            Family::Poisson | Family::NegativeBinomial { .. } => mu,
            Family::Binomial => mu * (1.0 - mu),
            Family::Gaussian | Family::Gamma => 1.0,
        }
    }

    fn variance(&self, mu: f64) -> f64 {
        match self {
            Family::Poisson => mu,
            Family::NegativeBinomial { theta } => mu + mu * mu / theta,
            Family::Binomial => mu * (1.0 - mu),
            Family::Gaussian => 1.0,
            Family::Gamma => mu * mu,
        }
    }

    fn initial_mu(&self, y: f64) -> f64 {
        match self {
            Family::Poisson | Family::NegativeBinomial { .. } => y + 0.1,
            Family::Binomial => (y + 0.5) / 2.0,
            Family::Gaussian | Family::Gamma => y,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlmOptions {
    pub max_iter: usize,
    pub tol: f64,
    /// Added to the diagonal of `X'WX` (intercept excluded).
    pub ridge: f64,
}

impl Default for GlmOptions {
    fn default() -> Self {
        GlmOptions {
            max_iter: 25,
            tol: 1e-8,
            ridge: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GlmFit {
    pub coefficients: DVector<f64>,
    pub std_errors: DVector<f64>,
    pub log_likelihood: f64,
    pub fitted: DVector<f64>,
    pub converged: bool,
    pub iterations: usize,
}

impl GlmFit {
    /// Wald z statistic of one coefficient.
    pub fn wald_z(&self, coefficient: usize) -> f64 {
        self.coefficients[coefficient] / self.std_errors[coefficient]
    }
}

/// `n` rows: an intercept column, then `columns`, then every covariate column.
pub fn design_matrix(
    n: usize,
    columns: &[&[f64]],
    covariates: Option<&Array2<f64>>,
) -> Result<DMatrix<f64>> {
    if columns.iter().any(|c| c.len() != n) {
        bail!("Design columns do not have {} rows", n);
    }
    let n_cov = match covariates {
        Some(cov) if cov.nrows() != n => {
            bail!("Covariate rows ({}) do not match design rows ({})", cov.nrows(), n)
        }
        Some(cov) => cov.ncols(),
        None => 0,
    };

    let p = 1 + columns.len() + n_cov;
    Ok(DMatrix::from_fn(n, p, |i, j| {
        if j == 0 {
            1.0
        } else if j <= columns.len() {
            columns[j - 1][i]
        } else {
            covariates.map_or(0.0, |cov| cov[[i, j - 1 - columns.len()]])
        }
    }))
}

/// Cholesky factor of `X'WX`, rejecting numerically rank-deficient designs.
fn factorize(m: DMatrix<f64>) -> Result<Cholesky<f64, Dyn>> {
    let scale = m.diagonal().amax().max(1.0);
    let chol = m
        .cholesky()
        .ok_or_else(|| anyhow!("Singular weighted design matrix"))?;
    if chol.l_dirty().diagonal().iter().any(|&d| !(d * d > 1e-12 * scale)) {
        bail!("Singular weighted design matrix");
    }
    Ok(chol)
}

pub fn log_likelihood(y: &[f64], mu: &[f64], family: Family) -> f64 {
    match family {
        Family::Poisson => y
            .iter()
            .zip(mu)
            .map(|(&yi, &mi)| {
                let mi = mi.max(MU_EPS);
                yi * mi.ln() - mi - ln_gamma(yi + 1.0)
            })
            .sum(),
        Family::NegativeBinomial { theta } => nb_log_likelihood(y, mu, theta),
        Family::Binomial => y
            .iter()
            .zip(mu)
            .map(|(&yi, &mi)| yi * mi.ln() + (1.0 - yi) * (1.0 - mi).ln())
            .sum(),
        Family::Gaussian => {
            let n = y.len() as f64;
            let rss: f64 = y.iter().zip(mu).map(|(yi, mi)| (yi - mi) * (yi - mi)).sum();
            let sigma2 = (rss / n).max(f64::MIN_POSITIVE);
            -0.5 * n * ((2.0 * std::f64::consts::PI * sigma2).ln() + 1.0)
        }
        // Unit shape; only compared between iterations of one fit
        Family::Gamma => -y.iter().zip(mu).map(|(&yi, &mi)| mi.ln() + yi / mi).sum::<f64>(),
    }
}

fn nb_log_likelihood(y: &[f64], mu: &[f64], theta: f64) -> f64 {
    let lg_theta = ln_gamma(theta);
    y.iter()
        .zip(mu)
        .map(|(&yi, &mi)| {
            let mi = mi.max(MU_EPS);
            ln_gamma(yi + theta) - lg_theta - ln_gamma(yi + 1.0)
                + theta * (theta / (theta + mi)).ln()
                + yi * (mi / (theta + mi)).ln()
        })
        .sum()
}

/// Fit `family` to `y` by IRLS.
///
/// `offset` is added to the linear predictor (log size factors for count
/// models). Errors when `X'WX` is singular or the estimates stop being finite.
pub fn fit_glm(
    x: &DMatrix<f64>,
    y: &[f64],
    offset: Option<&[f64]>,
    family: Family,
    opts: &GlmOptions,
) -> Result<GlmFit> {
    let n = x.nrows();
    let p = x.ncols();
    if y.len() != n {
        bail!("Response length ({}) does not match design rows ({})", y.len(), n);
    }
    if let Some(off) = offset {
        if off.len() != n {
            bail!("Offset length ({}) does not match design rows ({})", off.len(), n);
        }
    }
    if n < p {
        bail!("Model has more coefficients ({}) than observations ({})", p, n);
    }
    let off = |i: usize| offset.map_or(0.0, |o| o[i]);

    let mut mu: Vec<f64> = y.iter().map(|&yi| family.initial_mu(yi)).collect();
    let mut eta: Vec<f64> = mu.iter().map(|&m| family.link(m)).collect();
    let mut beta = DVector::zeros(p);
    let mut previous_ll = f64::INFINITY;
    let mut converged = false;
    let mut iterations = 0;

    while iterations < opts.max_iter {
        iterations += 1;

        let mut xw = x.clone();
        let mut zw = DVector::zeros(n);
        for i in 0..n {
            let d = family.mu_eta(mu[i]);
            let w = (d * d / family.variance(mu[i])).max(MU_EPS);
            let z = eta[i] - off(i) + (y[i] - mu[i]) / d.max(MU_EPS);
            let sw = w.sqrt();
            xw.row_mut(i).scale_mut(sw);
            zw[i] = z * sw;
        }

        let mut xtwx = xw.transpose() * &xw;
        for j in 1..p {
            xtwx[(j, j)] += opts.ridge;
        }
        let rhs = xw.transpose() * &zw;
        let chol = factorize(xtwx)?;
        beta = chol.solve(&rhs);
        if beta.iter().any(|b| !b.is_finite()) {
            bail!("Non-finite coefficient estimate");
        }

        let lin = x * &beta;
        for i in 0..n {
            eta[i] = lin[i] + off(i);
            mu[i] = family.link_inverse(eta[i]);
        }

        let ll = log_likelihood(y, &mu, family);
        let change = (ll - previous_ll).abs();
        previous_ll = ll;
        if change <= opts.tol * (ll.abs() + 0.1) {
            converged = true;
            break;
        }
    }

    // Final information matrix at the converged estimate
    let mut xw = x.clone();
    for i in 0..n {
        let d = family.mu_eta(mu[i]);
        let w = (d * d / family.variance(mu[i])).max(MU_EPS);
        xw.row_mut(i).scale_mut(w.sqrt());
    }
    let mut info = xw.transpose() * &xw;
    for j in 1..p {
        info[(j, j)] += opts.ridge;
    }
    let covariance = factorize(info)?.inverse();

    let dispersion = match family {
        Family::Gaussian if n > p => {
            let rss: f64 = y.iter().zip(&mu).map(|(yi, mi)| (yi - mi) * (yi - mi)).sum();
            rss / (n - p) as f64
        }
        Family::Gaussian => f64::NAN,
        _ => 1.0,
    };
    let std_errors = DVector::from_fn(p, |j, _| (covariance[(j, j)] * dispersion).sqrt());

    let log_likelihood = log_likelihood(y, &mu, family);
    if !log_likelihood.is_finite() {
        bail!("Non-finite log-likelihood");
    }

    Ok(GlmFit {
        coefficients: beta,
        std_errors,
        log_likelihood,
        fitted: DVector::from_vec(mu),
        converged,
        iterations,
    })
}

/// Maximum-likelihood NB size parameter for fixed means, by golden-section
/// search over `ln(theta)`.
pub fn nb_theta_ml(y: &[f64], mu: &[f64]) -> f64 {
    let objective = |ln_theta: f64| nb_log_likelihood(y, mu, ln_theta.exp());
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let (mut a, mut b) = THETA_LN_BOUNDS;
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let mut fc = objective(c);
    let mut fd = objective(d);

    while (b - a).abs() > 1e-6 {
        if fc > fd {
            b = d;
            d = c;
            fd = fc;
            c = b - ratio * (b - a);
            fc = objective(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + ratio * (b - a);
            fd = objective(d);
        }
    }
    ((a + b) / 2.0).exp()
}

/// Alternate between NB coefficient fits and theta estimation, starting from a
/// Poisson fit. Returns the final fit with its theta.
pub fn fit_negative_binomial(
    x: &DMatrix<f64>,
    y: &[f64],
    offset: Option<&[f64]>,
    opts: &GlmOptions,
) -> Result<(GlmFit, f64)> {
    let mut fit = fit_glm(x, y, offset, Family::Poisson, opts)?;
    let mut theta = nb_theta_ml(y, fit.fitted.as_slice());

    for _ in 0..10 {
        fit = fit_glm(x, y, offset, Family::NegativeBinomial { theta }, opts)?;
        let next = nb_theta_ml(y, fit.fitted.as_slice());
        let settled = (next.ln() - theta.ln()).abs() < 1e-4;
        theta = next;
        if settled {
            break;
        }
    }
    Ok((fit, theta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn group_design(n1: usize, n2: usize) -> (DMatrix<f64>, Vec<f64>) {
        let group: Vec<f64> = (0..n1 + n2).map(|i| if i < n1 { 0.0 } else { 1.0 }).collect();
        (design_matrix(n1 + n2, &[group.as_slice()], None).unwrap(), group)
    }

    #[test]
    fn test_poisson_group_coefficient_is_log_ratio() {
        // With one binary predictor the MLE reproduces the group means exactly.
        let y = [1.0, 2.0, 3.0, 2.0, 4.0, 6.0, 5.0, 5.0];
        let (x, _) = group_design(4, 4);
        let fit = fit_glm(&x, &y, None, Family::Poisson, &GlmOptions::default()).unwrap();
        assert!(fit.converged);
        assert_relative_eq!(fit.coefficients[0], 2f64.ln(), epsilon = 1e-6);
        assert_relative_eq!(fit.coefficients[1], 5f64.ln() - 2f64.ln(), epsilon = 1e-6);
        // Var(log mean) = 1 / (n * mean) for each group
        let se = (1.0 / 8.0 + 1.0 / 20.0f64).sqrt();
        assert_relative_eq!(fit.std_errors[1], se, epsilon = 1e-5);
    }

    #[test]
    fn test_gaussian_matches_least_squares() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let y = [2.1, 3.9, 6.2, 7.8, 10.1];
        let x = design_matrix(xs.len(), &[xs.as_slice()], None).unwrap();
        let fit = fit_glm(&x, &y, None, Family::Gaussian, &GlmOptions::default()).unwrap();
        // lm(y ~ x): intercept 0.05, slope 1.99
        assert_relative_eq!(fit.coefficients[0], 0.05, epsilon = 1e-9);
        assert_relative_eq!(fit.coefficients[1], 1.99, epsilon = 1e-9);
    }

    #[test]
    fn test_logistic_fitted_probabilities() {
        let xs = [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        let y = [0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        let x = design_matrix(xs.len(), &[xs.as_slice()], None).unwrap();
        let fit = fit_glm(&x, &y, None, Family::Binomial, &GlmOptions::default()).unwrap();
        assert_relative_eq!(fit.fitted[0], 0.25, epsilon = 1e-6);
        assert_relative_eq!(fit.fitted[7], 0.75, epsilon = 1e-6);
        assert_relative_eq!(fit.coefficients[1], 9f64.ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_offset_shifts_intercept() {
        let y = [2.0, 4.0, 2.0, 4.0];
        let x = design_matrix(4, &[], None).unwrap();
        let offset = [0.0, 2f64.ln(), 0.0, 2f64.ln()];
        let opts = GlmOptions::default();
        let fit = fit_glm(&x, &y, Some(offset.as_slice()), Family::Poisson, &opts).unwrap();
        assert_relative_eq!(fit.coefficients[0], 2f64.ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_theta_tracks_overdispersion() {
        let mu = vec![5.0; 10];
        let overdispersed = [0.0, 0.0, 1.0, 14.0, 0.0, 2.0, 18.0, 0.0, 15.0, 0.0];
        let tame = [4.0, 5.0, 6.0, 5.0, 4.0, 6.0, 5.0, 5.0, 4.0, 6.0];
        assert!(nb_theta_ml(&overdispersed, &mu) < 1.0);
        assert!(nb_theta_ml(&tame, &mu) > 1000.0);
    }

    #[test]
    fn test_negative_binomial_fit_runs() {
        let y = [0.0, 1.0, 0.0, 3.0, 0.0, 2.0, 9.0, 14.0, 0.0, 11.0, 7.0, 20.0];
        let (x, _) = group_design(6, 6);
        let (fit, theta) = fit_negative_binomial(&x, &y, None, &GlmOptions::default()).unwrap();
        assert!(theta > 0.0 && theta.is_finite());
        assert!(fit.coefficients[1] > 0.0);
        assert!(fit.wald_z(1).is_finite());
    }

    #[test]
    fn test_singular_design_errors() {
        let col = [1.0, 2.0, 3.0, 4.0];
        let x = design_matrix(4, &[col.as_slice(), col.as_slice()], None).unwrap();
        let y = [1.0, 2.0, 3.0, 4.0];
        assert!(fit_glm(&x, &y, None, Family::Gaussian, &GlmOptions::default()).is_err());
    }
}
