use proptest::prelude::*;
use rshogi_nn::{CyclicSchedule, NnError, schedule};

fn control() -> impl Strategy<Value = f32> {
    -100.0f32..100.0
}

#[test]
fn test_reference_sequence() {
    let s = schedule(1.0, 4.0, 1.0, 5).unwrap();
    assert_eq!(s, vec![1.0, 2.5, 4.0, 2.5, 1.0]);
}

#[test]
fn test_single_step() {
    assert_eq!(schedule(0.3, 9.0, -2.0, 1).unwrap(), vec![0.3]);
}

#[test]
fn test_zero_length_is_invalid() {
    assert!(matches!(
        schedule(1.0, 2.0, 3.0, 0),
        Err(NnError::InvalidConfiguration(_))
    ));
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

    #[test]
    fn prop_endpoints(start in control(), peak in control(), end in control(), n in 2usize..400) {
        let s = schedule(start, peak, end, n).unwrap();
        prop_assert_eq!(s.len(), n);
        prop_assert_eq!(s[0], start);
        let tol = 1e-4 * (1.0 + start.abs() + peak.abs() + end.abs());
        prop_assert!((s[n - 1] - end).abs() <= tol, "last={} end={}", s[n - 1], end);
    }

    #[test]
    fn prop_monotonic_halves(start in control(), peak in control(), end in control(), n in 2usize..400) {
        let sched = CyclicSchedule::new(start, peak, end, n).unwrap();
        let s = sched.as_slice();
        let mid = sched.peak_index();
        let tol = 1e-4 * (1.0 + start.abs() + peak.abs() + end.abs());

        let rising = peak >= start;
        for w in s[..=mid].windows(2) {
            if rising {
                prop_assert!(w[1] >= w[0] - tol);
            } else {
                prop_assert!(w[1] <= w[0] + tol);
            }
        }
        let rising = end >= peak;
        for w in s[mid..].windows(2) {
            if rising {
                prop_assert!(w[1] >= w[0] - tol);
            } else {
                prop_assert!(w[1] <= w[0] + tol);
            }
        }
    }

    #[test]
    fn prop_deterministic(start in control(), peak in control(), end in control(), n in 1usize..200) {
        prop_assert_eq!(
            schedule(start, peak, end, n).unwrap(),
            schedule(start, peak, end, n).unwrap()
        );
    }

    #[test]
    fn prop_peak_at_middle(n in 4usize..400) {
        let sched = CyclicSchedule::new(0.0, 1.0, 0.0, n).unwrap();
        prop_assert_eq!(sched.peak_index(), n / 2);
        prop_assert!((sched.get(n / 2) - 1.0).abs() < 1e-6);
    }
}
