//! Lesson catalog: built-in scenarios, TOML overrides and persona names.

use rand::seq::SliceRandom;
use tracing::{error, info};

use crate::domain::{Difficulty, Lesson};

/// Default target language for the built-in catalog.
pub const DEFAULT_LANGUAGE: &str = "Spanish";

pub const DEFAULT_PERSONAS: [&str; 10] =
  ["Alex", "Taylor", "Jordan", "Casey", "Riley", "Morgan", "Jamie", "Avery", "Quinn", "Sam"];

fn lesson(
  id: &str,
  title: &str,
  description: &str,
  difficulty: Difficulty,
  estimated_minutes: u32,
  scenario: &str,
  goal: &str,
) -> Lesson {
  Lesson {
    id: id.into(),
    title: title.into(),
    description: description.into(),
    difficulty,
    language: DEFAULT_LANGUAGE.into(),
    estimated_minutes,
    scenario: scenario.into(),
    goal: goal.into(),
  }
}

/// Built-in lessons. Always present unless replaced by id from TOML.
pub fn builtin_lessons() -> Vec<Lesson> {
  vec![
    lesson(
      "cafe-ordering",
      "Ordering at a Café",
      "Learn how to order food and drinks at a café or restaurant.",
      Difficulty::VeryEasy,
      5,
      "You are at a café in Madrid and want to order something to eat and drink.",
      "Successfully order a meal and understand the server's responses.",
    ),
    lesson(
      "train-station",
      "At the Train Station",
      "Learn how to buy tickets and navigate a train station.",
      Difficulty::Intermediate,
      8,
      "You are at a busy train station in Barcelona and need to buy tickets for your journey.",
      "Purchase the correct tickets and find your platform.",
    ),
    lesson(
      "business-meeting",
      "Business Meeting",
      "Learn how to participate in a business meeting and discuss project updates.",
      Difficulty::Advanced,
      10,
      "You are attending a business meeting with colleagues to discuss a new project.",
      "Introduce yourself, discuss your ideas, and understand others' contributions.",
    ),
    lesson(
      "grocery-shopping",
      "Grocery Shopping",
      "Learn how to shop for groceries and interact with store employees.",
      Difficulty::Beginner,
      6,
      "You are shopping for ingredients to make dinner at a local grocery store.",
      "Decide what to make for dinner, make a shopping list, find the items in the store, and check out.",
    ),
    lesson(
      "doctor-visit",
      "Doctor's Appointment",
      "Learn how to describe symptoms and understand medical advice.",
      Difficulty::Intermediate,
      9,
      "You are visiting a doctor because you have been feeling unwell.",
      "Explain your symptoms and understand the doctor's diagnosis and instructions.",
    ),
    lesson(
      "hotel-checkin",
      "Hotel Check-in",
      "Learn how to check in to a hotel and request amenities.",
      Difficulty::Beginner,
      5,
      "You have just arrived at your hotel in Valencia after a long journey and need to check in.",
      "Complete the check-in process and ask about hotel facilities.",
    ),
  ]
}

/// Immutable, ordered lesson list. Lookups are a linear scan; the catalog is small.
#[derive(Clone, Debug)]
pub struct LessonCatalog {
  lessons: Vec<Lesson>,
}

impl LessonCatalog {
  pub fn new(lessons: Vec<Lesson>) -> Self {
    Self { lessons }
  }

  /// Built-ins with configured lessons merged in: same id replaces in place, new ids append.
  pub fn with_overrides(overrides: Vec<Lesson>) -> Self {
    let mut lessons = builtin_lessons();
    for l in overrides {
      if l.id.trim().is_empty() || l.scenario.trim().is_empty() || l.goal.trim().is_empty() {
        error!(target: "lesson", id = %l.id, "Skipping configured lesson: missing id, scenario or goal.");
        continue;
      }
      match lessons.iter_mut().find(|existing| existing.id == l.id) {
        Some(existing) => {
          info!(target: "lesson", id = %l.id, "Configured lesson replaces built-in");
          *existing = l;
        }
        None => lessons.push(l),
      }
    }
    Self { lessons }
  }

  pub fn lessons(&self) -> &[Lesson] {
    &self.lessons
  }

  pub fn get_lesson_by_id(&self, id: &str) -> Option<&Lesson> {
    self.lessons.iter().find(|l| l.id == id)
  }
}

impl Default for LessonCatalog {
  fn default() -> Self {
    Self::new(builtin_lessons())
  }
}

/// Pick a tutor persona at random. Falls back to the default list when `names` is empty.
pub fn random_persona_name(names: &[String]) -> String {
  let mut rng = rand::thread_rng();
  match names.choose(&mut rng) {
    Some(name) => name.clone(),
    None => DEFAULT_PERSONAS.choose(&mut rng).copied().unwrap_or("Alex").to_string(),
  }
}
