// Group records

use crate::address::DEFAULT_GROUP;
use serde::Serialize;

/// Display colors handed out to groups in id order
const PALETTE: [&str; 8] = [
    "#F5A623", "#4A90E2", "#7ED321", "#D0021B", "#9013FE", "#50E3C2", "#F8E71C", "#BD10E0",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub id: u16,
    pub name: String,
    pub color: String,
}

impl Group {
    pub fn new(id: u16) -> Self {
        let index = id.wrapping_sub(DEFAULT_GROUP) as usize;
        let name = if id == DEFAULT_GROUP {
            "Default".to_string()
        } else {
            format!("Group {}", index)
        };
        Self {
            id,
            name,
            color: PALETTE[index % PALETTE.len()].to_string(),
        }
    }

    pub fn is_default(&self) -> bool {
        self.id == DEFAULT_GROUP
    }
}
