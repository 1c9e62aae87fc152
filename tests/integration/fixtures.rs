// tests/integration/fixtures.rs

use fleetsync::core::command::{Location, PortalSpec};

pub fn portal(name: &str) -> PortalSpec {
    PortalSpec {
        name: name.to_string(),
        kind: "nether".to_string(),
        destination: "south".to_string(),
        fill: "air".to_string(),
        min: Location::new("world", 10.0, 64.0, -5.0),
        max: Location::new("world", 12.0, 66.0, -3.0),
    }
}
