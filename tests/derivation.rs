// SPDX-FileCopyrightText: 2024 Wavelens UG <info@wavelens.io>
//
// SPDX-License-Identifier: EUPL-1.2

mod utils;

use nix_talk::{nix::wire, Derivation, DerivationOutput};
use rand::{seq::SliceRandom, Rng};
use std::collections::{BTreeSet, HashMap};
use utils::{init_logging, num, string};

fn random_drv() -> Derivation {
    let mut rng = rand::thread_rng();
    let outputs = ["out", "dev", "lib", "man", "doc"]
        .iter()
        .take(rng.gen_range(1..=5))
        .map(|name| {
            (
                name.to_string(),
                DerivationOutput {
                    path: format!("/nix/store/{:032}-pkg-{}", rng.gen::<u64>(), name),
                    ..Default::default()
                },
            )
        })
        .collect();
    let input_sources = (0..rng.gen_range(0..10))
        .map(|n| format!("/nix/store/{:032}-src-{}", rng.gen::<u32>(), n))
        .collect();
    let env = (0..rng.gen_range(0..20))
        .map(|n| (format!("VAR_{}_{}", rng.gen::<u16>(), n), format!("{}", rng.gen::<u64>())))
        .collect();
    Derivation {
        name: "pkg".into(),
        outputs,
        input_sources,
        input_derivations: HashMap::from([(
            "/nix/store/ffffffffffffffffffffffffffffffff-dep.drv".to_string(),
            BTreeSet::from(["out".to_string()]),
        )]),
        platform: "x86_64-linux".into(),
        builder: "/bin/sh".into(),
        args: vec!["-c".into(), "echo $out > $out".into()],
        env,
    }
}

// Rebuilds every map from a shuffled list of its entries, and shuffles the input sources.
fn permuted(drv: &Derivation) -> Derivation {
    let mut rng = rand::thread_rng();
    let mut outputs = drv.outputs.clone().into_iter().collect::<Vec<_>>();
    outputs.shuffle(&mut rng);
    let mut env = drv.env.clone().into_iter().collect::<Vec<_>>();
    env.shuffle(&mut rng);
    let mut input_sources = drv.input_sources.clone();
    input_sources.shuffle(&mut rng);
    Derivation {
        outputs: outputs.into_iter().collect(),
        env: env.into_iter().collect(),
        input_sources,
        ..drv.clone()
    }
}

async fn serialize(drv: &Derivation) -> Vec<u8> {
    let mut buf = Vec::new();
    wire::write_derivation(&mut buf, drv).await.unwrap();
    buf
}

#[tokio::test]
async fn test_serialization_is_deterministic() {
    init_logging();
    for _ in 0..20 {
        let drv = random_drv();
        assert_eq!(serialize(&drv).await, serialize(&drv).await);
    }
}

#[tokio::test]
async fn test_serialization_ignores_insertion_order() {
    init_logging();
    for _ in 0..20 {
        let drv = random_drv();
        let expected = serialize(&drv).await;
        for _ in 0..5 {
            assert_eq!(expected, serialize(&permuted(&drv)).await);
        }
    }
}

#[tokio::test]
async fn test_serialization_keeps_duplicate_input_sources() {
    init_logging();
    let drv = Derivation {
        input_sources: vec![
            "/nix/store/b".into(),
            "/nix/store/a".into(),
            "/nix/store/b".into(),
        ],
        ..Default::default()
    };

    let mut expected = Vec::new();
    expected.extend(num(0)); // outputs[]
    expected.extend(num(3)); // input_sources[]
    expected.extend(string("/nix/store/a"));
    expected.extend(string("/nix/store/b"));
    expected.extend(string("/nix/store/b"));
    expected.extend(string("")); // platform
    expected.extend(string("")); // builder
    expected.extend(num(0)); // args[]
    expected.extend(num(0)); // env[]
    assert_eq!(expected, serialize(&drv).await);
}
