// tests/property/codec_roundtrip_test.rs

//! Property-based tests for the command codec and channel envelope

use bytes::Bytes;
use fleetsync::core::channel::Envelope;
use fleetsync::core::command::{Command, Location, PortalSpec};
use proptest::prelude::*;

fn name() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_ ]{0,24}"
}

fn location() -> impl Strategy<Value = Location> {
    (name(), -3.0e7..3.0e7f64, -64.0..320.0f64, -3.0e7..3.0e7f64)
        .prop_map(|(world, x, y, z)| Location::new(world, x, y, z))
}

fn portal() -> impl Strategy<Value = PortalSpec> {
    (name(), name(), name(), name(), location(), location()).prop_map(
        |(name, kind, destination, fill, min, max)| PortalSpec {
            name,
            kind,
            destination,
            fill,
            min,
            max,
        },
    )
}

fn command() -> impl Strategy<Value = Command> {
    prop_oneof![
        (name(), name(), name(), any::<bool>()).prop_map(
            |(player, destination_server, destination, has_permission)| {
                Command::TeleportPlayer {
                    player,
                    destination_server,
                    destination,
                    has_permission,
                }
            }
        ),
        name().prop_map(|player| Command::ListPortals { player }),
        (name(), name()).prop_map(|(player, portal)| Command::DeletePortal { player, portal }),
        (name(), proptest::option::of(portal()))
            .prop_map(|(player, selection)| Command::SetPortal { player, selection }),
        Just(Command::RequestPortals),
        ".{0,64}".prop_map(|version| Command::SendVersion { version }),
        portal().prop_map(Command::SendPortal),
        name().prop_map(|portal| Command::RemovePortal { portal }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_command_roundtrip(command in command()) {
        let frame = command.encode().unwrap();
        prop_assert_eq!(Command::decode(&frame).unwrap(), command);
    }

    #[test]
    fn test_every_truncation_is_rejected(command in command()) {
        let frame = command.encode().unwrap();
        for cut in 0..frame.len() {
            prop_assert!(
                Command::decode(&frame[..cut]).is_err(),
                "prefix of {} bytes decoded", cut
            );
        }
    }

    #[test]
    fn test_trailing_bytes_are_ignored(
        command in command(),
        trailer in prop::collection::vec(any::<u8>(), 0..32)
    ) {
        let mut frame = command.encode().unwrap().to_vec();
        frame.extend_from_slice(&trailer);
        prop_assert_eq!(Command::decode(&frame).unwrap(), command);
    }

    #[test]
    fn test_envelope_roundtrip(
        sender in any::<u64>(),
        origin in "[a-z0-9-]{1,16}",
        target in proptest::option::of("[a-z0-9-]{1,16}"),
        frame in prop::collection::vec(any::<u8>(), 0..256)
    ) {
        let envelope = Envelope {
            sender,
            origin,
            target,
            frame: Bytes::from(frame),
        };
        let payload = envelope.encode().unwrap();
        prop_assert_eq!(Envelope::decode(&payload).unwrap(), envelope);
    }

    #[test]
    fn test_envelope_addressing(
        target in proptest::option::of("[a-z]{1,8}"),
        server in "[a-z]{1,8}"
    ) {
        let envelope = Envelope {
            sender: 1,
            origin: "proxy".into(),
            target: target.clone(),
            frame: Bytes::new(),
        };
        let expected = target.as_deref().is_none_or(|t| t == server);
        prop_assert_eq!(envelope.is_addressed_to(&server), expected);
    }
}
