use spreadwatch::adapters::ProxyRegistry;
use spreadwatch::collector::{candidate_score, metrics, TickWindow};
use spreadwatch::domain::{Tick, TickSource};

fn tick(bid: f64, ask: f64, ts: i64) -> Tick {
    Tick::new("X", bid, ask, ts, TickSource::Polled).unwrap()
}

#[test]
fn test_all_medium_spread_window() {
    // 0.005% spread sits inside the medium band
    let ticks: Vec<Tick> = (0..3).map(|i| tick(100.0, 100.005, i)).collect();
    let report = metrics("X", &ticks).unwrap();

    assert_eq!(report.medium_spread_freq, 100.0);
    assert_eq!(report.zero_spread_freq, 0.0);
    assert!(report.stability_score > 0.0 && report.stability_score <= 100.0);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["scoreBreakdown"]["stabilityBonus"], "200.0");
    assert_eq!(json["scoreBreakdown"]["lowSpreadBonus"], "0.0");
}

#[test]
fn test_one_negative_spread_tick() {
    let ticks = vec![
        tick(100.0, 99.0, 0),
        tick(100.0, 100.001, 1),
        tick(100.0, 100.001, 2),
    ];
    let report = metrics("X", &ticks).unwrap();

    assert!((report.negative_spread_freq - 100.0 / 3.0).abs() < 1e-9);
    assert!(report.score_breakdown.negative_spread_bonus > 0.0);
    // the same tick also counts as zero and low
    assert!((report.zero_spread_freq - 100.0 / 3.0).abs() < 1e-9);
    assert_eq!(report.min_spread, -1.0);
}

#[test]
fn test_adversarial_windows_stay_in_range() {
    let cases: Vec<Vec<Tick>> = vec![
        (0..10).map(|i| tick(100.0, 100.0, i)).collect(),
        (0..10).map(|i| tick(100.0, 150.0, i)).collect(),
        (0..10).map(|i| tick(100.0, 1.0, i)).collect(),
        (0..10)
            .map(|i| if i % 2 == 0 { tick(1.0, 1_000.0, i) } else { tick(1_000.0, 1.0, i) })
            .collect(),
        vec![tick(1e-9, 1e9, 0), tick(1e9, 1e-9, 1), tick(1.0, 1.0, 2)],
    ];

    for ticks in cases {
        let report = metrics("X", &ticks).unwrap();
        assert!(
            (0.0..=100.0).contains(&report.stability_score),
            "score {} out of range",
            report.stability_score
        );
    }
}

#[test]
fn test_zero_and_very_high_extremes_clamp() {
    let zero: Vec<Tick> = (0..5).map(|i| tick(10.0, 10.0, i)).collect();
    assert_eq!(metrics("X", &zero).unwrap().stability_score, 100.0);

    let wide: Vec<Tick> = (0..5).map(|i| tick(10.0, 11.0, i)).collect();
    assert_eq!(metrics("X", &wide).unwrap().stability_score, 0.0);
}

#[test]
fn test_candidate_score_bounds() {
    let mut window = TickWindow::new();
    for i in 0..9 {
        window.push(tick(100.0, 100.0, i * 1_000), 180_000, 180);
    }
    assert_eq!(candidate_score(&window), 0);

    for i in 9..400 {
        let ask = if i % 3 == 0 { 250.0 } else { 100.0 };
        window.push(tick(100.0, ask, i * 1_000), 180_000, 180);
        assert!(candidate_score(&window) <= 100);
    }
}

#[test]
fn test_all_failed_proxies_reset_to_first() {
    let registry = ProxyRegistry::new();
    registry.load("10.0.0.1:8000\n10.0.0.2:8000\n10.0.0.3:8000\n");
    for proxy in registry.proxies() {
        registry.mark_failed(&proxy);
    }
    assert_eq!(registry.stats().failed, 3);

    let next = registry.next().unwrap();
    assert_eq!(next.host, "10.0.0.1");
    let stats = registry.stats();
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.active, 3);
}
