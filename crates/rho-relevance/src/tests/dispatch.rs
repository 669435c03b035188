//! Dispatch modes: single, ordered, conditioned.

use super::*;
use ndarray::arr1;

fn session_net() -> Network {
    two_dense_net()
}

fn state_for(network: &Network, index: usize) -> ReverseState {
    ReverseState::new(network, index)
}

#[test]
fn test_single_mode_repeats_rule() {
    let network = session_net();
    let assignment = RuleAssignment::single("Z");
    let mut session = DispatchSession::new(&assignment);
    for index in [1usize, 0] {
        let kind = session
            .select(&state_for(&network, index), &network.layers()[index])
            .unwrap();
        assert_eq!(kind, RuleKind::Z);
    }
}

#[test]
fn test_ordered_mode_consumes_from_the_end() {
    // List is in forward-layer order; the reverse traversal sees the
    // deepest node first, so it takes the last entry.
    let network = session_net();
    let assignment = RuleAssignment::Ordered(vec![RuleSpec::named("Flat"), RuleSpec::named("Z")]);
    let mut session = DispatchSession::new(&assignment);

    let deepest = session
        .select(&state_for(&network, 1), &network.layers()[1])
        .unwrap();
    assert_eq!(deepest, RuleKind::Z);

    let shallow = session
        .select(&state_for(&network, 0), &network.layers()[0])
        .unwrap();
    assert_eq!(shallow, RuleKind::Flat);
}

#[test]
fn test_ordered_mode_exhaustion_errors() {
    let network = session_net();
    let assignment = RuleAssignment::Ordered(vec![RuleSpec::named("Z")]);
    let mut session = DispatchSession::new(&assignment);

    session
        .select(&state_for(&network, 1), &network.layers()[1])
        .unwrap();
    let err = session
        .select(&state_for(&network, 0), &network.layers()[0])
        .unwrap_err();
    match err {
        RhoError::RulesExhausted { node, provided } => {
            assert_eq!(node, "dense_0");
            assert_eq!(provided, 1);
        }
        other => panic!("expected RulesExhausted, got {other:?}"),
    }
}

#[test]
fn test_ordered_mode_extra_entries_are_ignored() {
    // More rules than kernel nodes: the front of the list is unused.
    let network = session_net();
    let assignment = RuleAssignment::Ordered(vec![
        RuleSpec::named("WSquare"),
        RuleSpec::named("Flat"),
        RuleSpec::named("Z"),
    ]);
    let mut session = DispatchSession::new(&assignment);
    assert_eq!(
        session
            .select(&state_for(&network, 1), &network.layers()[1])
            .unwrap(),
        RuleKind::Z
    );
    assert_eq!(
        session
            .select(&state_for(&network, 0), &network.layers()[0])
            .unwrap(),
        RuleKind::Flat
    );
}

#[test]
fn test_assignment_is_reusable_across_sessions() {
    // The cursor lives in the session; a second pass over the same
    // assignment starts fresh.
    let network = session_net();
    let assignment = RuleAssignment::Ordered(vec![RuleSpec::named("Flat"), RuleSpec::named("Z")]);
    for _ in 0..2 {
        let mut session = DispatchSession::new(&assignment);
        assert!(session
            .select(&state_for(&network, 1), &network.layers()[1])
            .is_ok());
        assert!(session
            .select(&state_for(&network, 0), &network.layers()[0])
            .is_ok());
    }
    assert_eq!(
        assignment,
        RuleAssignment::Ordered(vec![RuleSpec::named("Flat"), RuleSpec::named("Z")])
    );
}

#[test]
fn test_conditioned_mode_first_match_wins() {
    let network = session_net();
    let assignment = RuleAssignment::Conditioned(vec![
        (RuleCondition::IndexIs(0), RuleSpec::named("Flat")),
        (RuleCondition::Always, RuleSpec::named("Z")),
        // Shadowed by the catch-all above.
        (RuleCondition::IndexIs(1), RuleSpec::named("WSquare")),
    ]);
    let mut session = DispatchSession::new(&assignment);
    assert_eq!(
        session
            .select(&state_for(&network, 1), &network.layers()[1])
            .unwrap(),
        RuleKind::Z
    );
    assert_eq!(
        session
            .select(&state_for(&network, 0), &network.layers()[0])
            .unwrap(),
        RuleKind::Flat
    );
}

#[test]
fn test_conditioned_mode_no_match_errors() {
    let network = session_net();
    let assignment =
        RuleAssignment::Conditioned(vec![(RuleCondition::IndexIs(7), RuleSpec::named("Z"))]);
    let mut session = DispatchSession::new(&assignment);
    let err = session
        .select(&state_for(&network, 0), &network.layers()[0])
        .unwrap_err();
    match err {
        RhoError::NoRuleApplies { node } => assert_eq!(node, "dense_0"),
        other => panic!("expected NoRuleApplies, got {other:?}"),
    }
}

#[test]
fn test_conditions_match_kind_and_name() {
    let network = Network::new(vec![
        dense_from(&[&[1.0]], None, Activation::Linear),
        Layer::Flatten(FlattenLayer),
    ]);
    let dense = &network.layers()[0];
    let state = state_for(&network, 0);

    assert!(RuleCondition::KindIs(LayerKind::Dense).matches(&state, dense));
    assert!(!RuleCondition::KindIs(LayerKind::Conv2d).matches(&state, dense));
    assert!(RuleCondition::NameIs("dense_0".to_string()).matches(&state, dense));
    assert!(RuleCondition::IndexAtMost(0).matches(&state, dense));

    let state1 = state_for(&network, 1);
    assert!(!RuleCondition::IndexAtMost(0).matches(&state1, &network.layers()[1]));
}

#[test]
fn test_unknown_rule_name_surfaces_at_dispatch() {
    let network = session_net();
    let assignment = RuleAssignment::single("Zed");
    let mut session = DispatchSession::new(&assignment);
    let err = session
        .select(&state_for(&network, 1), &network.layers()[1])
        .unwrap_err();
    assert!(matches!(err, RhoError::UnknownRule(name) if name == "Zed"));
}

#[test]
fn test_names_are_case_sensitive() {
    let network = session_net();
    let assignment = RuleAssignment::single("z");
    let mut session = DispatchSession::new(&assignment);
    assert!(matches!(
        session.select(&state_for(&network, 1), &network.layers()[1]),
        Err(RhoError::UnknownRule(_))
    ));
}

#[test]
fn test_assignment_serde_roundtrip() {
    let assignment = RuleAssignment::Conditioned(vec![
        (
            RuleCondition::KindIs(LayerKind::Conv2d),
            RuleSpec::Inline(RuleKind::Boxed {
                low: 0.0,
                high: 1.0,
            }),
        ),
        (RuleCondition::Always, RuleSpec::named("Epsilon")),
    ]);
    let json = serde_json::to_string(&assignment).unwrap();
    let back: RuleAssignment = serde_json::from_str(&json).unwrap();
    assert_eq!(back, assignment);
}

#[test]
fn test_ordered_end_to_end_on_analyzer() {
    let network = Network::new(vec![dense_from(&[&[1.0, 2.0, 3.0]], None, Activation::Linear)]);
    let config = AnalyzerConfig::new(RuleAssignment::Ordered(vec![RuleSpec::named("Flat")]));
    let analyzer = LrpAnalyzer::new(network, config).unwrap();
    let out = analyzer
        .analyze(&arr1(&[1.0f32, 1.0, 1.0]).into_dyn())
        .unwrap();
    // Output = 6; Flat splits it evenly over the three inputs.
    assert_all_close(&out, &arr1(&[2.0f32, 2.0, 2.0]).into_dyn(), 1e-5);
}
