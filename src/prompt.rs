use std::io::IsTerminal;

use anyhow::{bail, Result};
use dialoguer::{Input, MultiSelect};

use forage_core::config::WorkflowConfig;
use forage_core::domain::MealTag;

/// What the diner asked for, after filling gaps from the terminal.
pub struct Request {
    pub meals: Vec<MealTag>,
    pub food_preferences: Option<String>,
    pub constraints: Option<String>,
}

/// Fill in whatever the flags left out.
///
/// Prompts only when stdin is a terminal. Without one, missing preferences
/// and constraints fall back to the configured defaults, and missing meals
/// are an error.
pub fn complete_request(
    meals: Vec<MealTag>,
    food_preferences: Option<String>,
    constraints: Option<String>,
    defaults: &WorkflowConfig,
) -> Result<Request> {
    let interactive = std::io::stdin().is_terminal();

    let meals = if !meals.is_empty() {
        meals
    } else if interactive {
        ask_meals()?
    } else {
        bail!("no meals given; pass --meal breakfast|lunch|dinner");
    };

    let food_preferences = match food_preferences {
        Some(p) => Some(p),
        None if interactive => Some(ask_text(
            "Food preferences",
            &defaults.food_preferences,
        )?),
        None => None,
    };

    let constraints = match constraints {
        Some(c) => Some(c),
        None if interactive => Some(ask_text(
            "Dietary or budget constraints",
            &defaults.constraints,
        )?),
        None => None,
    };

    Ok(Request {
        meals,
        food_preferences,
        constraints,
    })
}

fn ask_meals() -> Result<Vec<MealTag>> {
    let labels: Vec<&str> = MealTag::ALL.iter().map(MealTag::as_str).collect();
    let picked = MultiSelect::new()
        .with_prompt("Which meals should be planned? (space to toggle)")
        .items(&labels)
        .defaults(&[false, true, true])
        .interact()?;

    if picked.is_empty() {
        bail!("no meals selected");
    }
    Ok(picked.into_iter().map(|i| MealTag::ALL[i]).collect())
}

fn ask_text(prompt: &str, default: &str) -> Result<String> {
    let answer: String = Input::new()
        .with_prompt(prompt)
        .default(default.to_string())
        .interact_text()?;
    Ok(answer.trim().to_string())
}
