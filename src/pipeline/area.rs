//! Human queues ("areas") a conversation can be routed to.
//!
//! The set of queues is closed: adding one is a code change, and every
//! mapping below is an exhaustive `match`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A queue that owns a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Area {
    /// Default queue: the bot owns the conversation and shows the menu.
    General,
    /// Administration (payments, certificates).
    Admin,
    /// Current students.
    Alumnos,
    /// Sales / enrolment.
    Ventas,
    /// Community and events.
    Comunidad,
}

/// Every area, in menu order after the default queue.
pub const ALL_AREAS: [Area; 5] = [
    Area::General,
    Area::Admin,
    Area::Alumnos,
    Area::Ventas,
    Area::Comunidad,
];

impl Area {
    /// The default queue new conversations land in.
    pub const DEFAULT: Area = Area::General;

    /// Storage key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Admin => "admin",
            Self::Alumnos => "alumnos",
            Self::Ventas => "ventas",
            Self::Comunidad => "comunidad",
        }
    }

    /// Name shown to the contact in templated replies.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::General => "Atención General",
            Self::Admin => "Administración",
            Self::Alumnos => "Atención a Alumnos",
            Self::Ventas => "Ventas e Inscripciones",
            Self::Comunidad => "Comunidad",
        }
    }

    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown area key read from storage or config.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown area: {0}")]
pub struct UnknownArea(pub String);

impl FromStr for Area {
    type Err = UnknownArea;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "general" => Ok(Self::General),
            "admin" => Ok(Self::Admin),
            "alumnos" => Ok(Self::Alumnos),
            "ventas" => Ok(Self::Ventas),
            "comunidad" => Ok(Self::Comunidad),
            other => Err(UnknownArea(other.to_string())),
        }
    }
}

/// One entry of the root menu.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MenuOption {
    pub number: u8,
    pub area: Area,
    pub sub_label: &'static str,
}

/// Root menu, numbered from 1.
pub const ROOT_MENU: [MenuOption; 4] = [
    MenuOption {
        number: 1,
        area: Area::Admin,
        sub_label: "administracion",
    },
    MenuOption {
        number: 2,
        area: Area::Alumnos,
        sub_label: "alumnos",
    },
    MenuOption {
        number: 3,
        area: Area::Ventas,
        sub_label: "inscripciones",
    },
    MenuOption {
        number: 4,
        area: Area::Comunidad,
        sub_label: "comunidad",
    },
];

/// Look up a root-menu option by its number.
pub fn menu_option(number: u8) -> Option<MenuOption> {
    ROOT_MENU.iter().copied().find(|opt| opt.number == number)
}
