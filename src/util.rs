/// Exponentially weighted moving average.
#[derive(Debug)]
pub(crate) struct MovingAverage {
    smoothing_factor: f64,
    average: Option<f64>,
}

impl MovingAverage {
    pub fn new(smoothing_factor: f64) -> Self {
        Self {
            smoothing_factor,
            average: None,
        }
    }

    pub fn update(&mut self, value: f64) {
        let average = match self.average {
            Some(average) => average + self.smoothing_factor * (value - average),
            None => value,
        };

        self.average = Some(average);
    }

    pub fn get(&self) -> Option<f64> {
        self.average
    }
}
