/// Property-based tests using proptest
/// Tests invariants that should hold for all inputs
use chrono::{Days, NaiveDate};
use proptest::prelude::*;
use uuid::Uuid;

use pharma_crm_api::cache_integrity::SealedEntry;
use pharma_crm_api::errors::AppError;
use pharma_crm_api::kpi::{cache_key, growth, ratio, KpiKind, KpiScope, Period};
use pharma_crm_api::models::KpiQuery;
use pharma_crm_api::scoring::{
    assess, classify, PillarTexts, PillarWeights, QualificationTier, ScoringConfig,
    TierThresholds,
};
use pharma_crm_api::validate::{is_valid_ndc, kpi_query};

fn arb_weight() -> impl Strategy<Value = f64> {
    prop_oneof![
        -1e6..1e6f64,
        Just(f64::NAN),
        Just(f64::INFINITY),
        Just(f64::NEG_INFINITY),
    ]
}

// Property: Assessment should never panic and stays within percentage bounds
proptest! {
    #[test]
    fn assessment_never_panics_on_arbitrary_texts(champion in "\\PC*", metrics in "\\PC*") {
        let texts = PillarTexts {
            champion: Some(champion),
            metrics: Some(metrics),
            ..Default::default()
        };
        let a = assess(Uuid::new_v4(), Uuid::new_v4(), &texts, &ScoringConfig::default());
        prop_assert!(a.overall_pct >= 0.0 && a.overall_pct <= 100.0);
        prop_assert_eq!(a.pillar_scores.len(), 9);
    }

    #[test]
    fn hostile_weights_never_panic_or_escape_bounds(
        ws in (
            arb_weight(), arb_weight(), arb_weight(),
            arb_weight(), arb_weight(), arb_weight(),
            arb_weight(), arb_weight(), arb_weight(),
        )
    ) {
        let config = ScoringConfig {
            weights: PillarWeights {
                metrics: ws.0,
                economic_buyer: ws.1,
                decision_criteria: ws.2,
                decision_process: ws.3,
                paper_process: ws.4,
                identify_pain: ws.5,
                implicate_pain: ws.6,
                champion: ws.7,
                competition: ws.8,
            },
            ..Default::default()
        };
        let texts = PillarTexts {
            champion: Some("Economic buyer confirmed budget during the Q3 review".to_string()),
            ..Default::default()
        };
        let a = assess(Uuid::new_v4(), Uuid::new_v4(), &texts, &config);

        if config.is_usable() {
            prop_assert!(a.overall_pct.is_finite());
            prop_assert!(a.overall_pct >= 0.0 && a.overall_pct <= 100.0);
        } else {
            // Broken configuration pins the result instead of leaking NaN
            prop_assert_eq!(a.overall_pct, 0.0);
            prop_assert_eq!(a.tier, QualificationTier::Poor);
        }
    }

    #[test]
    fn short_nonempty_text_earns_exactly_half_credit(text in "[a-zA-Z]{1,39}") {
        let texts = PillarTexts {
            champion: Some(text),
            ..Default::default()
        };
        let a = assess(Uuid::new_v4(), Uuid::new_v4(), &texts, &ScoringConfig::default());
        // Half of one equally weighted pillar out of nine
        prop_assert_eq!(a.overall_pct, 5.6);
    }

    #[test]
    fn classification_never_decreases_with_the_score(
        a in 0.0..=100.0f64,
        b in 0.0..=100.0f64
    ) {
        let t = TierThresholds::default();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(classify(lo, &t) <= classify(hi, &t));
    }
}

// Property: KPI arithmetic must stay finite for any realistic volumes
proptest! {
    #[test]
    fn ratio_is_always_finite(n in -1e12..1e12f64, d in -1e12..1e12f64) {
        prop_assert!(ratio(n, d).is_finite());
    }

    #[test]
    fn own_share_of_a_larger_market_stays_in_unit_range(
        own in 0i64..1_000_000,
        extra in 0i64..1_000_000
    ) {
        let market = own + extra;
        let share = ratio(own as f64, market as f64);
        if market > 0 {
            prop_assert!((0.0..=1.0).contains(&share));
        } else {
            prop_assert_eq!(share, 0.0);
        }
    }

    #[test]
    fn growth_is_finite_and_bounded_below(
        current in 0i64..1_000_000_000,
        previous in 0i64..1_000_000_000
    ) {
        let g = growth(current, previous);
        prop_assert!(g.is_finite());
        if previous == 0 {
            prop_assert_eq!(g, 0.0);
        } else {
            // Volume cannot shrink by more than everything it had
            prop_assert!(g >= -1.0);
        }
        if current == previous {
            prop_assert_eq!(g, 0.0);
        }
    }
}

// Property: Reporting periods and cache keys
proptest! {
    #[test]
    fn previous_period_is_adjacent_and_equal_length(
        offset in 0u64..20_000,
        len in 0u64..400
    ) {
        let from = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .checked_add_days(Days::new(offset))
            .unwrap();
        let to = from.checked_add_days(Days::new(len)).unwrap();
        let period = Period { from, to };

        let prev = period.previous().unwrap();
        prop_assert_eq!(prev.days(), period.days());
        prop_assert_eq!(prev.to.checked_add_days(Days::new(1)).unwrap(), period.from);
    }

    #[test]
    fn cache_keys_are_stable_and_distinguish_kinds(
        seed in any::<u128>(),
        offset in 0u64..10_000,
        len in 0u64..200
    ) {
        let org = Uuid::from_u128(seed);
        let from = NaiveDate::from_ymd_opt(2000, 1, 1)
            .unwrap()
            .checked_add_days(Days::new(offset))
            .unwrap();
        let to = from.checked_add_days(Days::new(len)).unwrap();
        let period = Period { from, to };
        let scope = KpiScope::default();

        let trx_key = cache_key(org, KpiKind::Trx, &scope, &period);
        prop_assert_eq!(&trx_key, &cache_key(org, KpiKind::Trx, &scope, &period));
        prop_assert_ne!(&trx_key, &cache_key(org, KpiKind::Nrx, &scope, &period));
        prop_assert!(trx_key.contains(&org.to_string()));
    }
}

// Property: Cache integrity seals
proptest! {
    #[test]
    fn sealed_payloads_round_trip(payload in "\\PC*") {
        let sealed = SealedEntry::new(payload.clone()).seal();
        prop_assert_eq!(SealedEntry::open(&sealed), Some(payload));
    }

    #[test]
    fn tampered_payloads_are_rejected(payload in "\\PC*", suffix in "[a-z]{1,8}") {
        let mut entry = SealedEntry::new(payload);
        entry.data.push_str(&suffix);
        let sealed = entry.seal();
        prop_assert_eq!(SealedEntry::open(&sealed), None);
    }
}

// Property: Request validation
proptest! {
    #[test]
    fn well_formed_ndc_codes_are_accepted(
        labeler in "[0-9]{4,5}",
        product in "[0-9]{3,4}",
        package in "[0-9]{1,2}"
    ) {
        let ndc = format!("{}-{}-{}", labeler, product, package);
        prop_assert!(is_valid_ndc(&ndc));
    }

    #[test]
    fn unhyphenated_ndc_codes_are_rejected(digits in "[0-9]{8,11}") {
        prop_assert!(!is_valid_ndc(&digits));
    }

    #[test]
    fn unknown_kpi_kind_strings_are_rejected(kind in "[a-z_]{1,20}") {
        prop_assume!(KpiKind::parse(&kind).is_none());
        let q = KpiQuery {
            kind,
            product_id: None,
            product_ndc: None,
            territory_id: None,
            rep_id: None,
            from: NaiveDate::from_ymd_opt(2026, 1, 1),
            to: NaiveDate::from_ymd_opt(2026, 1, 31),
            force: false,
        };
        match kpi_query(&q) {
            Err(AppError::Validation(issues)) => {
                prop_assert_eq!(issues.len(), 1);
                prop_assert_eq!(&issues[0].field, "kind");
            }
            other => prop_assert!(false, "expected a validation error, got {:?}", other.is_ok()),
        }
    }
}
