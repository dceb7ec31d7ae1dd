/// Log-lerp learning rate decay with an optional sin-shaped warmup delay.
#[derive(Debug, Clone)]
pub struct ExponLr {
    pub lr_init: f64,
    pub lr_final: f64,
    pub lr_delay_steps: u32,
    pub lr_delay_mult: f64,
    pub max_steps: u32,
}

impl ExponLr {
    pub fn new(lr_init: f64, lr_final: f64, max_steps: u32) -> Self {
        Self {
            lr_init,
            lr_final,
            lr_delay_steps: 0,
            lr_delay_mult: 1.0,
            max_steps,
        }
    }

    pub fn with_delay(mut self, steps: u32, mult: f64) -> Self {
        self.lr_delay_steps = steps;
        self.lr_delay_mult = mult;
        self
    }

    pub fn lr(&self, step: u32) -> f64 {
        if self.lr_init == 0.0 && self.lr_final == 0.0 {
            return 0.0;
        }
        let delay_rate = if self.lr_delay_steps > 0 {
            let p = (step as f64 / self.lr_delay_steps as f64).clamp(0.0, 1.0);
            self.lr_delay_mult
                + (1.0 - self.lr_delay_mult) * (0.5 * std::f64::consts::PI * p).sin()
        } else {
            1.0
        };
        let t = (step as f64 / self.max_steps as f64).clamp(0.0, 1.0);
        let log_lerp = (self.lr_init.ln() * (1.0 - t) + self.lr_final.ln() * t).exp();
        delay_rate * log_lerp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_between_endpoints() {
        let sched = ExponLr::new(1e-2, 1e-4, 100);
        assert!((sched.lr(0) - 1e-2).abs() < 1e-9);
        assert!((sched.lr(100) - 1e-4).abs() < 1e-9);
        assert!((sched.lr(50) - 1e-3).abs() < 1e-6);
        // Past the end the final rate holds.
        assert!((sched.lr(500) - 1e-4).abs() < 1e-9);
    }

    #[test]
    fn delay_ramps_up_from_the_damped_rate() {
        let sched = ExponLr::new(1e-2, 1e-2, 100).with_delay(10, 0.01);
        assert!((sched.lr(0) - 1e-4).abs() < 1e-9);
        assert!((sched.lr(10) - 1e-2).abs() < 1e-9);
        assert!(sched.lr(5) > sched.lr(0));
        assert!(sched.lr(5) < sched.lr(10));
    }
}
