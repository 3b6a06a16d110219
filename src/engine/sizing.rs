//! Lot sizing: scale master volume, then fit it to the broker's volume grid.

use rust_decimal::{Decimal, RoundingStrategy};
use tracing::warn;

use crate::broker::SymbolSpec;
use crate::models::{LotCalculationMode, ReplicationConfig};

/// Clamp applied before broker normalization to avoid representation drift.
const LOT_PRECISION: u32 = 8;

/// Computes slave volumes for a master policy.
pub struct LotSizer<'a> {
    config: &'a ReplicationConfig,
}

impl<'a> LotSizer<'a> {
    pub fn new(config: &'a ReplicationConfig) -> Self {
        Self { config }
    }

    /// Raw slave lots for `master_lots`, before broker normalization.
    ///
    /// Returns `None` when the product does not fit a `Decimal`.
    ///
    /// # Arguments
    /// * `master_lots` - Volume the master traded
    /// * `local_equity` - Current equity of this account, used by margin-ratio mode
    pub fn scale(&self, master_lots: Decimal, local_equity: Decimal) -> Option<Decimal> {
        let factor = match self.config.lot_calculation_mode {
            LotCalculationMode::Multiplier => self.config.lot_multiplier,
            LotCalculationMode::MarginRatio => match self.config.master_equity {
                Some(master_equity) if master_equity > Decimal::ZERO => {
                    local_equity.checked_div(master_equity)?
                }
                _ => {
                    warn!(
                        master = %self.config.master_account,
                        "Master equity unknown, sizing margin-ratio trade 1:1"
                    );
                    Decimal::ONE
                }
            },
        };

        let scaled = master_lots.checked_mul(factor);
        if scaled.is_none() {
            warn!(
                master = %self.config.master_account,
                lots = %master_lots,
                factor = %factor,
                "Scaled volume overflows"
            );
        }
        scaled.map(|lots| {
            lots.round_dp_with_strategy(LOT_PRECISION, RoundingStrategy::MidpointAwayFromZero)
        })
    }

    /// Scaled and normalized volume ready for the broker.
    pub fn lots_for(
        &self,
        master_lots: Decimal,
        local_equity: Decimal,
        spec: &SymbolSpec,
    ) -> Option<Decimal> {
        self.scale(master_lots, local_equity)
            .map(|lots| normalize_lot(lots, spec))
    }
}

/// Round down to the volume step, cap at the maximum and lift to the minimum.
///
/// Idempotent for any spec with `volume_min <= volume_max`.
pub fn normalize_lot(lots: Decimal, spec: &SymbolSpec) -> Decimal {
    let stepped = floor_to_step(lots, spec.volume_step);
    let capped = if spec.volume_max > Decimal::ZERO {
        stepped.min(floor_to_step(spec.volume_max, spec.volume_step).max(spec.volume_min))
    } else {
        stepped
    };
    capped.max(spec.volume_min).round_dp(LOT_PRECISION).normalize()
}

/// Volume to close for a partial close, or `None` when it rounds below the minimum.
pub fn partial_close_volume(
    current: Decimal,
    ratio: Decimal,
    spec: &SymbolSpec,
) -> Option<Decimal> {
    let raw = current.checked_mul(ratio)?.round_dp(LOT_PRECISION);
    let volume = floor_to_step(raw, spec.volume_step).min(current);
    if volume < spec.volume_min || volume <= Decimal::ZERO {
        return None;
    }
    Some(volume.normalize())
}

fn floor_to_step(lots: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return lots;
    }
    match lots.checked_div(step) {
        Some(steps) => steps.floor().checked_mul(step).unwrap_or(lots),
        None => lots,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spec() -> SymbolSpec {
        SymbolSpec::new("EURUSD", 5, dec!(0.01), dec!(0.01), dec!(100))
    }

    #[test]
    fn test_multiplier_sizing() {
        let config = ReplicationConfig {
            lot_multiplier: dec!(2.0),
            ..ReplicationConfig::new("M1")
        };
        let sizer = LotSizer::new(&config);

        assert_eq!(sizer.lots_for(dec!(1.0), dec!(5000), &spec()), Some(dec!(2)));
        assert_eq!(sizer.lots_for(dec!(0.13), dec!(5000), &spec()), Some(dec!(0.26)));
    }

    #[test]
    fn test_margin_ratio_sizing() {
        let config = ReplicationConfig {
            lot_calculation_mode: LotCalculationMode::MarginRatio,
            master_equity: Some(dec!(20000)),
            ..ReplicationConfig::new("M1")
        };
        let sizer = LotSizer::new(&config);

        // 5000 / 20000 = 0.25
        assert_eq!(sizer.lots_for(dec!(1.0), dec!(5000), &spec()), Some(dec!(0.25)));
        assert_eq!(sizer.lots_for(dec!(0.1), dec!(5000), &spec()), Some(dec!(0.02)));
    }

    #[test]
    fn test_margin_ratio_without_master_equity_is_one_to_one() {
        let config = ReplicationConfig {
            lot_calculation_mode: LotCalculationMode::MarginRatio,
            master_equity: Some(Decimal::ZERO),
            ..ReplicationConfig::new("M1")
        };
        assert_eq!(LotSizer::new(&config).scale(dec!(0.7), dec!(1000)), Some(dec!(0.7)));
    }

    #[test]
    fn test_scale_clamps_precision() {
        let config = ReplicationConfig {
            lot_multiplier: dec!(0.333333333333),
            ..ReplicationConfig::new("M1")
        };
        assert_eq!(LotSizer::new(&config).scale(dec!(1), Decimal::ZERO), Some(dec!(0.33333333)));
    }

    #[test]
    fn test_huge_multiplier_and_lots_do_not_overflow() {
        let config = ReplicationConfig {
            lot_multiplier: dec!(10000000000),
            ..ReplicationConfig::new("M1")
        };
        let sizer = LotSizer::new(&config);

        assert_eq!(sizer.scale(dec!(10000000000000000000), dec!(5000)), None);
        assert_eq!(sizer.lots_for(dec!(10000000000000000000), dec!(5000), &spec()), None);
        // Large but representable volumes are capped by the broker maximum
        assert_eq!(sizer.lots_for(dec!(1000), dec!(5000), &spec()), Some(dec!(100)));
    }

    #[test]
    fn test_margin_ratio_extreme_equity() {
        let config = ReplicationConfig {
            lot_calculation_mode: LotCalculationMode::MarginRatio,
            master_equity: Some(Decimal::new(1, 28)),
            ..ReplicationConfig::new("M1")
        };
        let sizer = LotSizer::new(&config);

        assert_eq!(sizer.scale(dec!(1), Decimal::MAX), None);
        assert_eq!(sizer.lots_for(dec!(1), dec!(1), &spec()), Some(dec!(100)));
    }

    #[test]
    fn test_normalize_huge_lots_on_fine_step() {
        let fine = SymbolSpec::new("BTCUSD", 2, dec!(0.00000001), dec!(0.00000001), dec!(0));
        let huge = Decimal::from_i128_with_scale(79_228_162_514_264_337_593_543_950, 0);
        assert_eq!(normalize_lot(huge, &fine), huge);
    }

    #[test]
    fn test_normalize_bounds() {
        let spec = spec();
        assert_eq!(normalize_lot(dec!(0.016), &spec), dec!(0.01));
        assert_eq!(normalize_lot(dec!(0.001), &spec), dec!(0.01)); // lifted to min
        assert_eq!(normalize_lot(dec!(250), &spec), dec!(100));

        let coarse = SymbolSpec::new("XAUUSD", 2, dec!(0.1), dec!(0.1), dec!(50));
        assert_eq!(normalize_lot(dec!(0.26), &coarse), dec!(0.2));
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let specs = [
            spec(),
            SymbolSpec::new("XAUUSD", 2, dec!(0.1), dec!(0.1), dec!(50)),
            SymbolSpec::new("ODD", 2, dec!(0.03), dec!(0.02), dec!(1.15)),
            SymbolSpec::new("IDX", 1, dec!(1), dec!(1), dec!(0)),
        ];
        let inputs = [
            dec!(0), dec!(0.004), dec!(0.015), dec!(0.333333), dec!(1.0), dec!(1.15),
            dec!(7.77), dec!(99.999), dec!(250),
        ];

        for spec in &specs {
            for lots in inputs {
                let once = normalize_lot(lots, spec);
                assert_eq!(normalize_lot(once, spec), once, "{} on {}", lots, spec.symbol);
            }
        }
    }

    #[test]
    fn test_partial_close_volume() {
        let spec = spec();
        assert_eq!(partial_close_volume(dec!(2.0), dec!(0.5), &spec), Some(dec!(1)));
        assert_eq!(partial_close_volume(dec!(0.3), dec!(0.333), &spec), Some(dec!(0.09)));
        assert_eq!(partial_close_volume(dec!(0.01), dec!(0.5), &spec), None); // below min
    }
}
