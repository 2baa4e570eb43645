//! Two-stage fuzzy share controller
//!
//! CPU is decided first from the relative CPU residual and the tracking
//! error. Memory is decided next from the relative memory residual, the
//! tracking error and the CPU residual recomputed against the CPU share
//! decided in the first stage.

use super::inference::{InferenceEngine, InferenceError, LinguisticVariable, Membership, RuleBase};
use super::{Controller, ControllerError, StageInput};
use crate::models::{EntityId, ResourceCategory};
use std::collections::BTreeMap;
use tracing::trace;

fn ramp(start: f64, end: f64) -> Membership {
    Membership::Ramp { start, end }
}

fn tri(a: f64, b: f64, c: f64) -> Membership {
    Membership::Triangle { a, b, c }
}

fn residual_variable(name: &str) -> LinguisticVariable {
    LinguisticVariable::new(name, (0.0, 1.0))
        .term("LOW", ramp(0.20, 0.00))
        .term("FINE", tri(0.10, 0.20, 0.30))
        .term("HIGH", ramp(0.20, 1.00))
}

fn error_variable() -> LinguisticVariable {
    LinguisticVariable::new("E", (-1.0, 1.0))
        .term("NEG", ramp(0.15, -0.10))
        .term("OK", tri(0.00, 0.15, 0.30))
        .term("POS", ramp(0.15, 0.40))
}

fn delta_variable(name: &str) -> LinguisticVariable {
    LinguisticVariable::new(name, (-1.0, 1.0))
        .term("BDW", tri(-1.00, -0.55, -0.10))
        .term("DWN", tri(-0.20, -0.125, -0.05))
        .term("STY", tri(-0.10, 0.00, 0.10))
        .term("UP", tri(0.05, 0.125, 0.20))
        .term("BUP", tri(0.10, 0.55, 1.00))
}

/// CPU rules over `(Cres, E)`
pub fn cpu_rule_base() -> Result<RuleBase, InferenceError> {
    const RULES: [(&str, &str, &str); 9] = [
        ("LOW", "NEG", "BUP"),
        ("LOW", "OK", "UP"),
        ("LOW", "POS", "UP"),
        ("FINE", "NEG", "UP"),
        ("FINE", "OK", "STY"),
        ("FINE", "POS", "DWN"),
        ("HIGH", "NEG", "STY"),
        ("HIGH", "OK", "DWN"),
        ("HIGH", "POS", "BDW"),
    ];
    RULES.iter().try_fold(
        RuleBase::new(
            vec![residual_variable("Cres"), error_variable()],
            delta_variable("DeltaC"),
        ),
        |base, &(cres, e, out)| base.rule(&[("Cres", cres), ("E", e)], out),
    )
}

/// Memory rules over `(Mres, E, Cres)`; unlisted combinations hold the share
pub fn memory_rule_base() -> Result<RuleBase, InferenceError> {
    const MOVES: [(&str, &str, &str, &str); 9] = [
        ("LOW", "NEG", "FINE", "UP"),
        ("LOW", "NEG", "HIGH", "BUP"),
        ("LOW", "POS", "FINE", "UP"),
        ("LOW", "POS", "HIGH", "UP"),
        ("FINE", "NEG", "HIGH", "UP"),
        ("FINE", "POS", "HIGH", "DWN"),
        ("HIGH", "OK", "HIGH", "DWN"),
        ("HIGH", "POS", "FINE", "DWN"),
        ("HIGH", "POS", "HIGH", "BDW"),
    ];
    const LEVELS: [&str; 3] = ["LOW", "FINE", "HIGH"];
    const ERRORS: [&str; 3] = ["NEG", "OK", "POS"];

    let mut base = RuleBase::new(
        vec![
            residual_variable("Mres"),
            error_variable(),
            residual_variable("Cres"),
        ],
        delta_variable("DeltaM"),
    );
    for mres in LEVELS {
        for e in ERRORS {
            for cres in LEVELS {
                let out = MOVES
                    .iter()
                    .find(|(m, er, c, _)| *m == mres && *er == e && *c == cres)
                    .map_or("STY", |(_, _, _, out)| *out);
                base = base.rule(&[("Mres", mres), ("E", e), ("Cres", cres)], out)?;
            }
        }
    }
    Ok(base)
}

/// Fuzzy controller deciding CPU, then memory
pub struct FuzzyRuleController {
    cpu: Box<dyn InferenceEngine>,
    memory: Box<dyn InferenceEngine>,
}

impl FuzzyRuleController {
    pub fn new(cpu: Box<dyn InferenceEngine>, memory: Box<dyn InferenceEngine>) -> Self {
        Self { cpu, memory }
    }

    /// Controller with the default two-stage rule tables
    pub fn fc2q() -> Result<Self, InferenceError> {
        Ok(Self::new(
            Box::new(cpu_rule_base()?),
            Box::new(memory_rule_base()?),
        ))
    }

    fn infer(
        engine: &dyn InferenceEngine,
        inputs: &[f64],
        entity: &str,
        category: ResourceCategory,
    ) -> Result<f64, ControllerError> {
        engine
            .infer(inputs)
            .map_err(|e| ControllerError::Configuration(e.to_string()))?
            .filter(|v| v.is_finite())
            .ok_or_else(|| ControllerError::RuleCoverage {
                entity: entity.to_string(),
                category,
            })
    }

    fn propose_cpu(&self, input: &StageInput<'_>) -> Result<BTreeMap<EntityId, f64>, ControllerError> {
        let error = input.primary_error()?;
        let mut deltas = BTreeMap::new();
        for (entity, m) in input.channels() {
            let cres = m.relative_residual().ok_or_else(|| {
                ControllerError::MissingInput(format!("cpu share of {} is zero", entity))
            })?;
            let delta = Self::infer(self.cpu.as_ref(), &[cres, error], entity, ResourceCategory::Cpu)?;
            trace!(entity = %entity, cres, error, delta, "CPU stage");
            deltas.insert(entity.clone(), delta);
        }
        Ok(deltas)
    }

    fn propose_memory(
        &self,
        input: &StageInput<'_>,
    ) -> Result<BTreeMap<EntityId, f64>, ControllerError> {
        let error = input.primary_error()?;
        let mut deltas = BTreeMap::new();
        for (entity, m) in input.channels() {
            let mres = m.relative_residual().ok_or_else(|| {
                ControllerError::MissingInput(format!("memory share of {} is zero", entity))
            })?;
            let cpu_share = input
                .current_share(entity, ResourceCategory::Cpu)
                .filter(|s| *s > 0.0)
                .ok_or_else(|| {
                    ControllerError::MissingInput(format!("cpu share of {}", entity))
                })?;
            let cpu_util = input
                .measurement(entity, ResourceCategory::Cpu)
                .map(|c| c.utilization)
                .ok_or_else(|| {
                    ControllerError::MissingInput(format!("cpu utilization of {}", entity))
                })?;
            let cres = (cpu_share - cpu_util) / cpu_share;
            let delta = Self::infer(
                self.memory.as_ref(),
                &[mres, error, cres],
                entity,
                ResourceCategory::Memory,
            )?;
            trace!(entity = %entity, mres, cres, error, delta, "Memory stage");
            deltas.insert(entity.clone(), delta);
        }
        Ok(deltas)
    }
}

impl Controller for FuzzyRuleController {
    fn name(&self) -> &'static str {
        "fuzzy"
    }

    fn categories(&self) -> Vec<ResourceCategory> {
        vec![ResourceCategory::Cpu, ResourceCategory::Memory]
    }

    fn propose(
        &mut self,
        input: &StageInput<'_>,
    ) -> Result<BTreeMap<EntityId, f64>, ControllerError> {
        match input.category {
            ResourceCategory::Cpu => self.propose_cpu(input),
            ResourceCategory::Memory => self.propose_memory(input),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PerformanceMetric, ResourceMeasurement};
    use std::sync::{Arc, Mutex};

    struct Fixture {
        errors: BTreeMap<PerformanceMetric, f64>,
        measurements: BTreeMap<(String, ResourceCategory), ResourceMeasurement>,
        bounds: BTreeMap<(String, ResourceCategory), super::super::DeltaBounds>,
        decided: BTreeMap<(String, ResourceCategory), f64>,
    }

    impl Fixture {
        fn new(error: f64, cpu: (f64, f64), mem: (f64, f64)) -> Self {
            let mut errors = BTreeMap::new();
            errors.insert(PerformanceMetric::ResponseTime, error);
            let mut measurements = BTreeMap::new();
            measurements.insert(
                ("vm1".to_string(), ResourceCategory::Cpu),
                ResourceMeasurement::new(cpu.0, cpu.1),
            );
            measurements.insert(
                ("vm1".to_string(), ResourceCategory::Memory),
                ResourceMeasurement::new(mem.0, mem.1),
            );
            Self {
                errors,
                measurements,
                bounds: BTreeMap::new(),
                decided: BTreeMap::new(),
            }
        }

        fn input(&self, category: ResourceCategory) -> StageInput<'_> {
            StageInput {
                category,
                errors: &self.errors,
                previous_errors: None,
                measurements: &self.measurements,
                bounds: &self.bounds,
                decided: &self.decided,
            }
        }
    }

    #[test]
    fn test_rule_tables_are_complete() {
        assert_eq!(cpu_rule_base().unwrap().rule_count(), 9);
        assert_eq!(memory_rule_base().unwrap().rule_count(), 27);
    }

    #[test]
    fn test_violation_with_low_residual_adds_cpu() {
        let mut controller = FuzzyRuleController::fc2q().unwrap();
        // share 0.5, utilization 0.5: no residual, strongly negative error
        let fx = Fixture::new(-0.5, (0.5, 0.5), (0.5, 0.3));
        let deltas = controller.propose(&fx.input(ResourceCategory::Cpu)).unwrap();
        assert!(deltas["vm1"] > 0.3, "delta was {}", deltas["vm1"]);
    }

    #[test]
    fn test_headroom_with_high_residual_removes_cpu() {
        let mut controller = FuzzyRuleController::fc2q().unwrap();
        let fx = Fixture::new(0.6, (0.8, 0.1), (0.5, 0.3));
        let deltas = controller.propose(&fx.input(ResourceCategory::Cpu)).unwrap();
        assert!(deltas["vm1"] < -0.3, "delta was {}", deltas["vm1"]);
    }

    #[test]
    fn test_fine_residual_on_target_stays() {
        let mut controller = FuzzyRuleController::fc2q().unwrap();
        // Cres = 0.2 (FINE), E = 0.15 (OK)
        let fx = Fixture::new(0.15, (0.5, 0.4), (0.5, 0.4));
        let deltas = controller.propose(&fx.input(ResourceCategory::Cpu)).unwrap();
        assert!(deltas["vm1"].abs() < 1e-6, "delta was {}", deltas["vm1"]);
    }

    /// Records the inputs of every inference call
    struct Recording {
        calls: Arc<Mutex<Vec<Vec<f64>>>>,
        output: f64,
    }

    impl InferenceEngine for Recording {
        fn inputs(&self) -> Vec<&str> {
            vec![]
        }

        fn infer(&self, inputs: &[f64]) -> Result<Option<f64>, InferenceError> {
            self.calls.lock().unwrap().push(inputs.to_vec());
            Ok(Some(self.output))
        }
    }

    #[test]
    fn test_memory_stage_uses_decided_cpu_share() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut controller = FuzzyRuleController::new(
            Box::new(Recording {
                calls: Arc::new(Mutex::new(Vec::new())),
                output: 0.1,
            }),
            Box::new(Recording {
                calls: calls.clone(),
                output: 0.0,
            }),
        );
        let mut fx = Fixture::new(-0.2, (0.4, 0.3), (0.5, 0.25));
        let cpu = controller.propose(&fx.input(ResourceCategory::Cpu)).unwrap();
        assert_eq!(cpu["vm1"], 0.1);

        fx.decided
            .insert(("vm1".to_string(), ResourceCategory::Cpu), 0.5);
        controller
            .propose(&fx.input(ResourceCategory::Memory))
            .unwrap();

        let calls = calls.lock().unwrap();
        let inputs = &calls[0];
        // Mres, E, Cres computed against the new CPU share of 0.5
        assert!((inputs[0] - 0.5).abs() < 1e-12);
        assert!((inputs[1] + 0.2).abs() < 1e-12);
        assert!((inputs[2] - (0.5 - 0.3) / 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_no_firing_rule_reports_coverage() {
        struct Silent;
        impl InferenceEngine for Silent {
            fn inputs(&self) -> Vec<&str> {
                vec![]
            }
            fn infer(&self, _inputs: &[f64]) -> Result<Option<f64>, InferenceError> {
                Ok(None)
            }
        }

        let mut controller = FuzzyRuleController::new(Box::new(Silent), Box::new(Silent));
        let fx = Fixture::new(0.0, (0.5, 0.2), (0.5, 0.2));
        let err = controller
            .propose(&fx.input(ResourceCategory::Cpu))
            .unwrap_err();
        assert!(matches!(err, ControllerError::RuleCoverage { .. }));
    }

    #[test]
    fn test_zero_share_is_missing_input() {
        let mut controller = FuzzyRuleController::fc2q().unwrap();
        let fx = Fixture::new(0.0, (0.0, 0.0), (0.5, 0.2));
        assert!(matches!(
            controller.propose(&fx.input(ResourceCategory::Cpu)),
            Err(ControllerError::MissingInput(_))
        ));
    }
}
