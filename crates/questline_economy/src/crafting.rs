//! # Crafting - Recipe Book
//!
//! **Static recipes, validated once at load**
//!
//! A recipe turns fixed quantities of materials into one unit of a result
//! item. The book guarantees at load time:
//!
//! 1. **No Cycles**: recipes form a DAG, so no loop of crafts can mint items
//! 2. **No Free Items**: every recipe consumes at least one positive quantity
//! 3. **Unique Ids**: a recipe id maps to exactly one definition
//!
//! The craft itself (check all, debit all, credit result) runs inside the
//! engine's unit of work.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::error::{EconomyError, EconomyResult};
use crate::inventory::ItemQuantity;
use crate::types::ItemId;

/// One material line of a recipe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Material {
    /// The material item.
    pub item_id: ItemId,
    /// Units consumed per craft.
    pub quantity: u64,
}

impl Material {
    /// Creates a new material line.
    #[must_use]
    pub fn new(item_id: impl Into<ItemId>, quantity: u64) -> Self {
        Self {
            item_id: item_id.into(),
            quantity,
        }
    }
}

/// A crafting recipe.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipe {
    /// Unique recipe identifier.
    pub id: String,
    /// Item produced, one unit per craft.
    pub result_item: ItemId,
    /// Items consumed.
    pub materials: Vec<Material>,
}

impl Recipe {
    /// Creates a recipe.
    #[must_use]
    pub fn new(id: impl Into<String>, result_item: impl Into<ItemId>, materials: Vec<Material>) -> Self {
        Self {
            id: id.into(),
            result_item: result_item.into(),
            materials,
        }
    }

    /// The materials as debit lines.
    #[must_use]
    pub fn debit_lines(&self) -> Vec<ItemQuantity> {
        self.materials
            .iter()
            .map(|m| ItemQuantity::new(m.item_id.clone(), m.quantity))
            .collect()
    }

    /// Checks the recipe on its own.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an empty id, no materials, a zero quantity, or a
    /// recipe that consumes its own result.
    pub fn validate(&self) -> EconomyResult<()> {
        if self.id.trim().is_empty() {
            return Err(EconomyError::Config("recipe id must not be empty".to_string()));
        }
        if self.materials.is_empty() {
            return Err(EconomyError::Config(format!(
                "recipe {} must have at least one material",
                self.id
            )));
        }
        for material in &self.materials {
            if material.quantity == 0 {
                return Err(EconomyError::Config(format!(
                    "recipe {} has zero quantity for {}",
                    self.id, material.item_id
                )));
            }
            if material.item_id == self.result_item {
                return Err(EconomyError::Config(format!(
                    "recipe {} consumes its own result {}",
                    self.id, self.result_item
                )));
            }
        }
        Ok(())
    }
}

/// All recipes, indexed and validated as a DAG.
#[derive(Clone, Debug, Default)]
pub struct RecipeBook {
    recipes: BTreeMap<String, Recipe>,
    /// Items mapped to the recipes that produce them.
    producers: HashMap<ItemId, Vec<String>>,
}

impl RecipeBook {
    /// Creates an empty book.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a book from recipes and validates it.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an invalid recipe, a duplicate id, or a cycle.
    pub fn from_recipes(recipes: impl IntoIterator<Item = Recipe>) -> EconomyResult<Self> {
        let mut book = Self::new();
        for recipe in recipes {
            book.add_recipe(recipe)?;
        }
        if let Some(cycle) = book.find_cycle() {
            return Err(EconomyError::Config(format!(
                "recipe cycle detected: {}",
                cycle.join(" -> ")
            )));
        }
        Ok(book)
    }

    /// Adds a recipe without checking for cycles.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the recipe is invalid or its id already exists.
    pub fn add_recipe(&mut self, recipe: Recipe) -> EconomyResult<()> {
        recipe.validate()?;
        if self.recipes.contains_key(&recipe.id) {
            return Err(EconomyError::Config(format!(
                "recipe id {} already exists",
                recipe.id
            )));
        }

        self.producers
            .entry(recipe.result_item.clone())
            .or_default()
            .push(recipe.id.clone());
        self.recipes.insert(recipe.id.clone(), recipe);
        Ok(())
    }

    /// Gets a recipe by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Recipe> {
        self.recipes.get(id)
    }

    /// Returns all recipes, ordered by id.
    pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
        self.recipes.values()
    }

    /// Returns the number of recipes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    /// Returns true if the book has no recipes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    /// Returns true if the recipes form a DAG.
    ///
    /// Uses Kahn's algorithm: recipe A precedes recipe B when A produces
    /// something B consumes.
    #[must_use]
    pub fn is_acyclic(&self) -> bool {
        let mut in_degree: HashMap<&str, usize> =
            self.recipes.keys().map(|id| (id.as_str(), 0)).collect();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();

        for (id, recipe) in &self.recipes {
            for material in &recipe.materials {
                for producer in self.producers.get(&material.item_id).into_iter().flatten() {
                    edges.entry(producer.as_str()).or_default().push(id.as_str());
                    *in_degree.entry(id.as_str()).or_insert(0) += 1;
                }
            }
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut sorted = 0;

        while let Some(id) = queue.pop_front() {
            sorted += 1;
            for &next in edges.get(id).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(next) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push_back(next);
                    }
                }
            }
        }

        sorted == self.recipes.len()
    }

    /// Returns one cycle of recipe ids (first id repeated at the end), if any.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for id in self.recipes.keys() {
            if !visited.contains(id.as_str()) {
                if let Some(cycle) = self.dfs_find_cycle(id, &mut visited, &mut on_stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_find_cycle<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(id);
        on_stack.insert(id);
        path.push(id);

        if let Some(recipe) = self.recipes.get(id) {
            for material in &recipe.materials {
                // Walk backwards: this recipe depends on whoever produces its materials.
                for producer in self.producers.get(&material.item_id).into_iter().flatten() {
                    let producer = producer.as_str();
                    if !visited.contains(producer) {
                        if let Some(cycle) = self.dfs_find_cycle(producer, visited, on_stack, path) {
                            return Some(cycle);
                        }
                    } else if on_stack.contains(producer) {
                        let start = path.iter().position(|&p| p == producer).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
                        cycle.push(producer.to_string());
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        on_stack.remove(id);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_book() -> RecipeBook {
        RecipeBook::from_recipes([
            Recipe::new(
                "crystal",
                "time_crystal",
                vec![Material::new("crystal_shard", 3), Material::new("stardust", 1)],
            ),
            Recipe::new(
                "hourglass",
                "golden_hourglass",
                vec![Material::new("time_crystal", 2), Material::new("stardust", 2)],
            ),
        ])
        .unwrap()
    }

    #[test]
    fn test_valid_chain_is_acyclic() {
        let book = test_book();
        assert!(book.is_acyclic());
        assert!(book.find_cycle().is_none());
        assert_eq!(book.len(), 2);
        assert_eq!(book.get("crystal").unwrap().result_item, "time_crystal");
    }

    #[test]
    fn test_cycle_is_rejected() {
        let result = RecipeBook::from_recipes([
            Recipe::new("a_to_b", "b", vec![Material::new("a", 1)]),
            Recipe::new("b_to_c", "c", vec![Material::new("b", 1)]),
            Recipe::new("c_to_a", "a", vec![Material::new("c", 1)]),
        ]);
        assert!(matches!(result, Err(EconomyError::Config(ref msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_cycle_detection_reports_path() {
        let mut book = RecipeBook::new();
        book.add_recipe(Recipe::new("a_to_b", "b", vec![Material::new("a", 1)])).unwrap();
        book.add_recipe(Recipe::new("b_to_a", "a", vec![Material::new("b", 1)])).unwrap();

        assert!(!book.is_acyclic());
        let cycle = book.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 3);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut book = test_book();
        let result = book.add_recipe(Recipe::new("crystal", "x", vec![Material::new("y", 1)]));
        assert!(matches!(result, Err(EconomyError::Config(_))));
    }

    #[test]
    fn test_invalid_recipes_rejected() {
        assert!(Recipe::new("empty", "x", vec![]).validate().is_err());
        assert!(Recipe::new("zero", "x", vec![Material::new("y", 0)]).validate().is_err());
        assert!(Recipe::new("self", "x", vec![Material::new("x", 1)]).validate().is_err());
        assert!(Recipe::new(" ", "x", vec![Material::new("y", 1)]).validate().is_err());
    }
}
