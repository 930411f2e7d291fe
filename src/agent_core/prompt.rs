//! User-turn text built from a chat request and its game context.

use std::fmt::Write;

use crate::bridge::protocol::ChatRequest;

/// Default system prompt when the config does not provide one.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an AI assistant inside a Garry's Mod server. \
Use the provided tools to act in the game world when the player asks for it, \
and keep chat replies short.";

/// Render the user turn: a `[Context]` block followed by the player's text.
pub fn build_user_message(request: &ChatRequest) -> String {
    let player = &request.player;
    let position = player.position.unwrap_or_default();

    let mut context = String::from("[Context]\n");
    // Writing to a String cannot fail.
    let _ = writeln!(context, "Player: {}", player.name.as_deref().unwrap_or("Unknown"));
    let _ = writeln!(context, "Position: ({}, {}, {})", position.x, position.y, position.z);
    let _ = writeln!(
        context,
        "Health: {} | Armor: {}",
        player.health.unwrap_or(100.0),
        player.armor.unwrap_or(0.0)
    );
    let _ = writeln!(context, "Current Weapon: {}", player.weapon.as_deref().unwrap_or("none"));
    let _ = writeln!(context, "Is Admin: {}", player.is_admin);
    let _ = write!(context, "Map: {}", request.map.as_deref().unwrap_or("unknown"));

    if let Some(looking_at) = &player.looking_at {
        let _ = write!(
            context,
            "\nLooking at: {} ({})",
            looking_at.class.as_deref().unwrap_or("unknown"),
            looking_at.model.as_deref().unwrap_or("no model")
        );
    }

    format!("{context}\n\n[Player Message]\n{}", request.text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{LookingAt, PlayerInfo, Position};

    fn request() -> ChatRequest {
        ChatRequest {
            message_id: "m1".to_string(),
            player: PlayerInfo {
                steamid: Some("STEAM_0:0:1".to_string()),
                name: Some("Alyx".to_string()),
                position: Some(Position {
                    x: 10.5,
                    y: -3.0,
                    z: 64.0,
                }),
                health: Some(80.0),
                armor: Some(15.0),
                weapon: Some("weapon_smg1".to_string()),
                is_admin: false,
                looking_at: None,
            },
            text: "give me a gravity gun".to_string(),
            map: Some("gm_flatgrass".to_string()),
        }
    }

    #[test]
    fn test_context_block() {
        let msg = build_user_message(&request());
        assert_eq!(
            msg,
            "[Context]\n\
             Player: Alyx\n\
             Position: (10.5, -3, 64)\n\
             Health: 80 | Armor: 15\n\
             Current Weapon: weapon_smg1\n\
             Is Admin: false\n\
             Map: gm_flatgrass\n\n\
             [Player Message]\n\
             give me a gravity gun"
        );
    }

    #[test]
    fn test_looking_at_line() {
        let mut req = request();
        req.player.looking_at = Some(LookingAt {
            class: Some("prop_physics".to_string()),
            model: None,
        });
        let msg = build_user_message(&req);
        assert!(msg.contains("Map: gm_flatgrass\nLooking at: prop_physics (no model)\n\n[Player Message]"));
    }

    #[test]
    fn test_missing_context_defaults() {
        let req = ChatRequest {
            message_id: "m2".to_string(),
            player: PlayerInfo::default(),
            text: "hi".to_string(),
            map: None,
        };
        let msg = build_user_message(&req);
        assert!(msg.contains("Player: Unknown"));
        assert!(msg.contains("Position: (0, 0, 0)"));
        assert!(msg.contains("Health: 100 | Armor: 0"));
        assert!(msg.contains("Map: unknown"));
    }
}
