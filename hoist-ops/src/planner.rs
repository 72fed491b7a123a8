//! Capacity planner.
//!
//! Three stages, all pure computation: forecast the arrival rate from a
//! historical series (EWMA, Holt-Winters, linear regression or seasonal
//! decomposition, auto-selected by in-sample MAPE), size the worker pool
//! with an M/M/c model against the wait-time SLO, and emit an ordered
//! scaling plan that respects step, cooldown and bound constraints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use hoist_core::{QueueError, QueueResult};

/// Forecasting model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForecastModel {
    /// Exponentially weighted moving average; the low-data default
    Ewma,
    /// Double exponential smoothing with a trend term
    HoltWinters,
    /// Ordinary least squares on the index
    LinearRegression,
    /// Seasonal decomposition with an explicit period
    SeasonalDecomposition,
}

/// Point + interval forecast
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Forecast {
    pub model: ForecastModel,
    /// Predicted arrival rate per step over the horizon
    pub points: Vec<f64>,
    /// Half-width of the interval around each point
    pub interval: f64,
    /// In-sample mean absolute percentage error of the chosen model
    pub mape: f64,
}

/// M/M/c assessment for one candidate server count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueingAssessment {
    pub servers: u32,
    /// Utilization rho = lambda / (c * mu)
    pub utilization: f64,
    /// Expected queue length
    pub queue_length: f64,
    /// Expected wait before service
    pub wait_time: Duration,
    /// Expected total response time
    pub response_time: Duration,
    /// Stability + data-quality confidence, 0..1
    pub confidence: f64,
}

/// Plan constraints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanConstraints {
    pub min_workers: u32,
    pub max_workers: u32,
    /// Largest single scaling step
    pub max_step: u32,
    /// Pause between consecutive steps
    pub cooldown: Duration,
    /// Optional cost ceiling, in workers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_cap_workers: Option<u32>,
}

impl Default for PlanConstraints {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 256,
            max_step: 8,
            cooldown: Duration::from_secs(120),
            cost_cap_workers: None,
        }
    }
}

/// One scaling action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingStep {
    pub scheduled_at: DateTime<Utc>,
    pub from: u32,
    pub to: u32,
    pub rationale: String,
}

/// Immutable once generated; a newer plan supersedes it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityPlan {
    pub current_workers: u32,
    pub target_workers: u32,
    pub steps: Vec<ScalingStep>,
    pub confidence: f64,
    pub valid_until: DateTime<Utc>,
    pub forecast: Forecast,
}

impl CapacityPlan {
    /// Whether an executor may apply the plan unattended
    pub fn auto_applicable(&self, confidence_threshold: f64) -> bool {
        self.confidence >= confidence_threshold && Utc::now() < self.valid_until
    }
}

fn mape(actual: &[f64], predicted: &[f64]) -> f64 {
    let mut total = 0.0;
    let mut n = 0u32;
    for (a, p) in actual.iter().zip(predicted) {
        if a.abs() > 1e-9 {
            total += ((a - p) / a).abs();
            n += 1;
        }
    }
    if n == 0 {
        f64::INFINITY
    } else {
        total / n as f64
    }
}

fn ewma_fit(series: &[f64], alpha: f64) -> (Vec<f64>, f64) {
    let mut level = series[0];
    let mut fitted = Vec::with_capacity(series.len());
    for value in series {
        fitted.push(level);
        level = alpha * value + (1.0 - alpha) * level;
    }
    (fitted, level)
}

fn holt_fit(series: &[f64], alpha: f64, beta: f64) -> (Vec<f64>, f64, f64) {
    let mut level = series[0];
    let mut trend = if series.len() > 1 {
        series[1] - series[0]
    } else {
        0.0
    };
    let mut fitted = Vec::with_capacity(series.len());
    for value in series {
        fitted.push(level + trend);
        let prev_level = level;
        level = alpha * value + (1.0 - alpha) * (level + trend);
        trend = beta * (level - prev_level) + (1.0 - beta) * trend;
    }
    (fitted, level, trend)
}

fn linear_fit(series: &[f64]) -> (Vec<f64>, f64, f64) {
    let n = series.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in series.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    let slope = if den.abs() < 1e-12 { 0.0 } else { num / den };
    let intercept = mean_y - slope * mean_x;
    let fitted = (0..series.len())
        .map(|i| intercept + slope * i as f64)
        .collect();
    (fitted, slope, intercept)
}

fn seasonal_fit(series: &[f64], period: usize) -> (Vec<f64>, Vec<f64>, f64) {
    let mean = series.iter().sum::<f64>() / series.len() as f64;
    let mut seasonal = vec![0.0; period];
    let mut counts = vec![0u32; period];
    for (i, value) in series.iter().enumerate() {
        seasonal[i % period] += value - mean;
        counts[i % period] += 1;
    }
    for (s, c) in seasonal.iter_mut().zip(&counts) {
        if *c > 0 {
            *s /= *c as f64;
        }
    }
    let fitted = (0..series.len())
        .map(|i| mean + seasonal[i % period])
        .collect();
    (fitted, seasonal, mean)
}

/// Forecast + queueing analysis + plan generation
pub struct CapacityPlanner {
    /// EWMA smoothing factor
    alpha: f64,
    /// Holt trend factor
    beta: f64,
    /// Seasonal period in steps, for the seasonal model
    seasonal_period: usize,
    /// Wait-time SLO the sizing targets
    target_wait: Duration,
    /// Safety margin applied to the forecast, fractional
    safety_margin: f64,
    plan_validity: Duration,
}

impl CapacityPlanner {
    pub fn new(target_wait: Duration) -> Self {
        Self {
            alpha: 0.3,
            beta: 0.1,
            seasonal_period: 24,
            target_wait,
            safety_margin: 0.2,
            plan_validity: Duration::from_secs(1800),
        }
    }

    pub fn with_seasonal_period(mut self, period: usize) -> Self {
        self.seasonal_period = period.max(2);
        self
    }

    pub fn with_safety_margin(mut self, margin: f64) -> Self {
        self.safety_margin = margin.max(0.0);
        self
    }

    /// Produce a point + interval forecast. With fewer than four samples
    /// only EWMA is considered; otherwise the model with the lowest
    /// in-sample MAPE wins.
    pub fn forecast(&self, series: &[f64], horizon: usize) -> QueueResult<Forecast> {
        if series.is_empty() {
            return Err(QueueError::Validation(
                "cannot forecast an empty series".to_string(),
            ));
        }
        let horizon = horizon.max(1);

        let mut candidates: Vec<(ForecastModel, Vec<f64>, Vec<f64>)> = Vec::new();

        let (ewma_fitted, ewma_level) = ewma_fit(series, self.alpha);
        candidates.push((
            ForecastModel::Ewma,
            ewma_fitted,
            vec![ewma_level; horizon],
        ));

        if series.len() >= 4 {
            let (holt_fitted, level, trend) = holt_fit(series, self.alpha, self.beta);
            let holt_points = (1..=horizon)
                .map(|h| (level + trend * h as f64).max(0.0))
                .collect();
            candidates.push((ForecastModel::HoltWinters, holt_fitted, holt_points));

            let (linear_fitted, slope, intercept) = linear_fit(series);
            let linear_points = (0..horizon)
                .map(|h| (intercept + slope * (series.len() + h) as f64).max(0.0))
                .collect();
            candidates.push((ForecastModel::LinearRegression, linear_fitted, linear_points));
        }

        if series.len() >= self.seasonal_period * 2 {
            let (seasonal_fitted, seasonal, mean) = seasonal_fit(series, self.seasonal_period);
            let seasonal_points = (0..horizon)
                .map(|h| (mean + seasonal[(series.len() + h) % self.seasonal_period]).max(0.0))
                .collect();
            candidates.push((
                ForecastModel::SeasonalDecomposition,
                seasonal_fitted,
                seasonal_points,
            ));
        }

        let (model, fitted, points) = candidates
            .into_iter()
            .min_by(|a, b| {
                mape(series, &a.1)
                    .partial_cmp(&mape(series, &b.1))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .expect("at least one candidate");

        let model_mape = mape(series, &fitted);
        // Interval from residual spread
        let residuals: Vec<f64> = series
            .iter()
            .zip(&fitted)
            .map(|(a, p)| (a - p).abs())
            .collect();
        let interval = if residuals.is_empty() {
            0.0
        } else {
            2.0 * residuals.iter().sum::<f64>() / residuals.len() as f64
        };

        debug!(?model, mape = model_mape, "forecast model selected");
        Ok(Forecast {
            model,
            points,
            interval,
            mape: model_mape,
        })
    }

    /// Erlang-C probability that an arrival waits
    fn erlang_c(servers: u32, offered_load: f64) -> f64 {
        let c = servers as f64;
        if offered_load >= c {
            return 1.0;
        }
        let mut term = 1.0;
        let mut sum = 1.0;
        for k in 1..servers {
            term *= offered_load / k as f64;
            sum += term;
        }
        let last = term * offered_load / c * (c / (c - offered_load));
        last / (sum + last)
    }

    /// M/M/c assessment for a candidate server count. `lambda` arrivals
    /// per second, `mu` completions per second per worker.
    pub fn assess(&self, lambda: f64, mu: f64, servers: u32) -> QueueResult<QueueingAssessment> {
        if mu <= 0.0 {
            return Err(QueueError::Validation(
                "service rate must be positive".to_string(),
            ));
        }
        let servers = servers.max(1);
        let offered = lambda / mu;
        let utilization = offered / servers as f64;

        let (queue_length, wait_secs) = if utilization >= 1.0 {
            (f64::INFINITY, f64::INFINITY)
        } else {
            let p_wait = Self::erlang_c(servers, offered);
            let wait = p_wait / (servers as f64 * mu - lambda);
            (lambda * wait, wait)
        };

        let confidence = if utilization >= 1.0 {
            0.0
        } else {
            // High utilization estimates are less trustworthy
            (1.0 - utilization).clamp(0.05, 0.95)
        };

        Ok(QueueingAssessment {
            servers,
            utilization,
            queue_length,
            wait_time: Duration::from_secs_f64(wait_secs.min(86_400.0)),
            response_time: Duration::from_secs_f64((wait_secs + 1.0 / mu).min(86_400.0)),
            confidence,
        })
    }

    /// Smallest server count whose projected wait meets the SLO with the
    /// safety margin applied to the forecast arrival rate.
    pub fn size_for(&self, lambda: f64, mu: f64, max_servers: u32) -> QueueResult<QueueingAssessment> {
        let padded = lambda * (1.0 + self.safety_margin);
        let floor = (padded / mu).ceil().max(1.0) as u32;
        for servers in floor..=max_servers.max(floor) {
            let assessment = self.assess(padded, mu, servers)?;
            if assessment.utilization < 1.0 && assessment.wait_time <= self.target_wait {
                return Ok(assessment);
            }
        }
        self.assess(padded, mu, max_servers.max(floor))
    }

    /// Full planning pass: forecast, size, then lay out bounded steps with
    /// cooldowns and rationales.
    pub fn plan(
        &self,
        series: &[f64],
        mu: f64,
        current_workers: u32,
        constraints: &PlanConstraints,
    ) -> QueueResult<CapacityPlan> {
        let forecast = self.forecast(series, 6)?;
        let peak = forecast
            .points
            .iter()
            .cloned()
            .fold(0.0f64, f64::max)
            + forecast.interval;

        let sized = self.size_for(peak, mu, constraints.max_workers)?;
        let mut target = sized
            .servers
            .clamp(constraints.min_workers, constraints.max_workers);
        if let Some(cap) = constraints.cost_cap_workers {
            target = target.min(cap);
        }

        let mut steps = Vec::new();
        let mut from = current_workers;
        let mut at = Utc::now();
        let cooldown = chrono::Duration::from_std(constraints.cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        while from != target {
            let to = if target > from {
                (from + constraints.max_step).min(target)
            } else {
                from.saturating_sub(constraints.max_step).max(target)
            };
            steps.push(ScalingStep {
                scheduled_at: at,
                from,
                to,
                rationale: format!(
                    "forecast peak {:.1}/s ({} model, mape {:.2}) needs {} workers for p95 wait <= {:?}",
                    peak, model_name(forecast.model), forecast.mape, target, self.target_wait
                ),
            });
            from = to;
            at += cooldown;
        }

        // Plan confidence: forecast quality blended with queueing confidence
        let forecast_confidence = (1.0 - forecast.mape).clamp(0.0, 1.0);
        let confidence = (forecast_confidence * 0.6 + sized.confidence * 0.4).clamp(0.0, 1.0);

        Ok(CapacityPlan {
            current_workers,
            target_workers: target,
            steps,
            confidence,
            valid_until: Utc::now()
                + chrono::Duration::from_std(self.plan_validity)
                    .unwrap_or_else(|_| chrono::Duration::minutes(30)),
            forecast,
        })
    }
}

fn model_name(model: ForecastModel) -> &'static str {
    match model {
        ForecastModel::Ewma => "ewma",
        ForecastModel::HoltWinters => "holt_winters",
        ForecastModel::LinearRegression => "linear_regression",
        ForecastModel::SeasonalDecomposition => "seasonal_decomposition",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planner() -> CapacityPlanner {
        CapacityPlanner::new(Duration::from_secs(5))
    }

    #[test]
    fn empty_series_is_rejected() {
        assert!(planner().forecast(&[], 3).is_err());
    }

    #[test]
    fn short_series_falls_back_to_ewma() {
        let forecast = planner().forecast(&[10.0, 12.0], 3).unwrap();
        assert_eq!(forecast.model, ForecastModel::Ewma);
        assert_eq!(forecast.points.len(), 3);
    }

    #[test]
    fn trending_series_prefers_a_trend_model() {
        let series: Vec<f64> = (0..20).map(|i| 10.0 + 5.0 * i as f64).collect();
        let forecast = planner().forecast(&series, 4).unwrap();
        assert!(matches!(
            forecast.model,
            ForecastModel::LinearRegression | ForecastModel::HoltWinters
        ));
        // Forecast continues the trend
        assert!(forecast.points[0] > series[series.len() - 1] * 0.9);
    }

    #[test]
    fn seasonal_series_prefers_the_seasonal_model() {
        let period = 6;
        let series: Vec<f64> = (0..36)
            .map(|i| 100.0 + 50.0 * ((i % period) as f64 - 2.5).abs())
            .collect();
        let forecast = planner()
            .with_seasonal_period(period)
            .forecast(&series, period)
            .unwrap();
        assert_eq!(forecast.model, ForecastModel::SeasonalDecomposition);
    }

    #[test]
    fn erlang_wait_decreases_with_servers() {
        let planner = planner();
        let few = planner.assess(8.0, 1.0, 9).unwrap();
        let many = planner.assess(8.0, 1.0, 16).unwrap();
        assert!(many.wait_time < few.wait_time);
        assert!(many.utilization < few.utilization);
    }

    #[test]
    fn overloaded_system_reports_saturation() {
        let assessment = planner().assess(20.0, 1.0, 10).unwrap();
        assert!(assessment.utilization >= 1.0);
        assert_eq!(assessment.confidence, 0.0);
    }

    #[test]
    fn sizing_meets_the_wait_slo() {
        let planner = CapacityPlanner::new(Duration::from_millis(500));
        let sized = planner.size_for(50.0, 2.0, 256).unwrap();
        assert!(sized.wait_time <= Duration::from_millis(500));
        assert!(sized.utilization < 1.0);
        // Needs at least the offered load with margin
        assert!(sized.servers >= 30);
    }

    #[test]
    fn plan_steps_respect_bounds_and_step_size() {
        let series: Vec<f64> = vec![40.0; 12];
        let constraints = PlanConstraints {
            min_workers: 1,
            max_workers: 100,
            max_step: 5,
            cooldown: Duration::from_secs(60),
            cost_cap_workers: None,
        };
        let plan = planner().plan(&series, 1.0, 10, &constraints).unwrap();

        assert!(plan.target_workers > 40);
        let mut previous = plan.current_workers;
        let mut last_time: Option<DateTime<Utc>> = None;
        for step in &plan.steps {
            assert_eq!(step.from, previous);
            assert!(step.to.abs_diff(step.from) <= 5);
            assert!(!step.rationale.is_empty());
            if let Some(last) = last_time {
                assert!(step.scheduled_at >= last + chrono::Duration::seconds(60));
            }
            last_time = Some(step.scheduled_at);
            previous = step.to;
        }
        assert_eq!(previous, plan.target_workers);
    }

    #[test]
    fn scale_down_plan_descends() {
        let series: Vec<f64> = vec![1.0; 12];
        let plan = planner()
            .plan(&series, 2.0, 50, &PlanConstraints::default())
            .unwrap();
        assert!(plan.target_workers < 50);
        for step in &plan.steps {
            assert!(step.to < step.from);
        }
    }

    #[test]
    fn cost_cap_limits_target() {
        let series: Vec<f64> = vec![100.0; 12];
        let constraints = PlanConstraints {
            cost_cap_workers: Some(20),
            ..PlanConstraints::default()
        };
        let plan = planner().plan(&series, 1.0, 5, &constraints).unwrap();
        assert_eq!(plan.target_workers, 20);
    }

    #[test]
    fn auto_apply_requires_confidence_and_freshness() {
        let series: Vec<f64> = vec![10.0; 24];
        let plan = planner()
            .plan(&series, 2.0, 6, &PlanConstraints::default())
            .unwrap();
        // A flat series fits well, so confidence is high
        assert!(plan.auto_applicable(0.5));
        assert!(!plan.auto_applicable(1.1));
    }
}
