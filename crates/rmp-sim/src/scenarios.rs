use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LossScenario {
    pub loss_rate_percent: u8,
    pub seed: u64,
}

pub const LOSSLESS: LossScenario = LossScenario {
    loss_rate_percent: 0,
    seed: 1,
};

pub const PRACTICAL_BASELINE: LossScenario = LossScenario {
    loss_rate_percent: 10,
    seed: 1,
};

pub const HOSTILE: LossScenario = LossScenario {
    loss_rate_percent: 40,
    seed: 7,
};

pub fn practical_baseline() -> LossScenario {
    PRACTICAL_BASELINE
}

impl LossScenario {
    pub fn with_seed(self, seed: u64) -> Self {
        Self { seed, ..self }
    }
}
