//! Workstation seats.
//!
//! Workstations are named seats on the office map; each maps to one of the
//! room's five computer slots. The table is shared by the room (seating an
//! NPC) and the reconciler (validating spawn configs).

pub const COMPUTER_SLOTS: usize = 5;
pub const WHITEBOARD_SLOTS: usize = 3;

const WORKSTATION_COMPUTERS: &[(&str, &str)] = &[
    ("design-studio", "0"),
    ("dev-loft", "1"),
    ("ops-desk", "2"),
    ("war-room", "3"),
    ("corner-office", "4"),
];

/// Computer slot for a workstation name, if the name is known.
/// Matching is case-insensitive.
pub fn computer_for(workstation_id: &str) -> Option<&'static str> {
    let w = workstation_id.trim().to_ascii_lowercase();
    WORKSTATION_COMPUTERS
        .iter()
        .find(|(name, _)| *name == w)
        .map(|(_, slot)| *slot)
}
