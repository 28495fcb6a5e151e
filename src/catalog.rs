//! Menu, supply list, suppliers and known postcodes.
//!
//! Workers iterate over cloned lists tagged with `version`. Any add or
//! remove of a dish or ingredient bumps the version, and a worker that sees
//! a newer version mid-pass abandons it with `ConcurrentMutation`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::{EntityKind, Result, SupplyError};
use crate::location::Postcode;
use crate::types::{Dish, Ingredient, ItemKey, ItemKind, Recipe, RestockLevels, Supplier};

pub struct Catalog {
    dishes: Mutex<Vec<Dish>>,
    ingredients: Mutex<Vec<Ingredient>>,
    suppliers: Mutex<Vec<Supplier>>,
    postcodes: Mutex<Vec<Postcode>>,
    version: AtomicU64,
}

fn locked<T>(list: &Mutex<Vec<T>>) -> MutexGuard<'_, Vec<T>> {
    list.lock().expect("catalog mutex poisoned")
}

impl Catalog {
    pub fn new() -> Self {
        Self::from_parts(Vec::new(), Vec::new(), Vec::new(), Vec::new())
    }

    pub fn from_parts(
        dishes: Vec<Dish>,
        ingredients: Vec<Ingredient>,
        suppliers: Vec<Supplier>,
        postcodes: Vec<Postcode>,
    ) -> Self {
        Self {
            dishes: Mutex::new(dishes),
            ingredients: Mutex::new(ingredients),
            suppliers: Mutex::new(suppliers),
            postcodes: Mutex::new(postcodes),
            version: AtomicU64::new(0),
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Fails if the lists changed since `seen` was read.
    pub fn ensure_version(&self, seen: u64) -> Result<()> {
        if self.version() == seen {
            Ok(())
        } else {
            Err(SupplyError::ConcurrentMutation)
        }
    }

    // Version is read under the list lock so it matches the copy.
    pub fn dishes(&self) -> (u64, Vec<Dish>) {
        let guard = locked(&self.dishes);
        (self.version(), guard.clone())
    }

    pub fn ingredients(&self) -> (u64, Vec<Ingredient>) {
        let guard = locked(&self.ingredients);
        (self.version(), guard.clone())
    }

    pub fn suppliers(&self) -> Vec<Supplier> {
        locked(&self.suppliers).clone()
    }

    pub fn postcodes(&self) -> Vec<Postcode> {
        locked(&self.postcodes).clone()
    }

    pub fn dish(&self, name: &str) -> Option<Dish> {
        let guard = locked(&self.dishes);
        guard.iter().find(|d| d.name == name).cloned()
    }

    pub fn ingredient(&self, name: &str) -> Option<Ingredient> {
        let guard = locked(&self.ingredients);
        guard.iter().find(|i| i.name == name).cloned()
    }

    pub fn supplier(&self, name: &str) -> Option<Supplier> {
        let guard = locked(&self.suppliers);
        guard.iter().find(|s| s.name == name).cloned()
    }

    pub fn postcode(&self, name: &str) -> Option<Postcode> {
        let guard = locked(&self.postcodes);
        guard.iter().find(|p| p.name == name).cloned()
    }

    fn check_recipe(&self, recipe: &Recipe) -> Result<()> {
        let guard = locked(&self.ingredients);
        for name in recipe.keys() {
            if !guard.iter().any(|i| &i.name == name) {
                return Err(SupplyError::not_found(EntityKind::Ingredient, name.clone()));
            }
        }
        Ok(())
    }

    pub fn add_dish(&self, dish: Dish) -> Result<()> {
        self.check_recipe(&dish.recipe)?;
        let mut guard = locked(&self.dishes);
        if guard.iter().any(|d| d.name == dish.name) {
            return Err(SupplyError::already_exists(EntityKind::Dish, dish.name));
        }
        guard.push(dish);
        self.bump();
        Ok(())
    }

    pub fn remove_dish(&self, name: &str) -> Result<Dish> {
        let mut guard = locked(&self.dishes);
        let index = guard
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Dish, name))?;
        self.bump();
        Ok(guard.remove(index))
    }

    pub fn add_ingredient(&self, ingredient: Ingredient) -> Result<()> {
        if self.supplier(&ingredient.supplier).is_none() {
            return Err(SupplyError::not_found(
                EntityKind::Supplier,
                ingredient.supplier,
            ));
        }
        let mut guard = locked(&self.ingredients);
        if guard.iter().any(|i| i.name == ingredient.name) {
            return Err(SupplyError::already_exists(
                EntityKind::Ingredient,
                ingredient.name,
            ));
        }
        guard.push(ingredient);
        self.bump();
        Ok(())
    }

    /// Removes the ingredient and strips it from every recipe.
    pub fn remove_ingredient(&self, name: &str) -> Result<Ingredient> {
        let mut dishes = locked(&self.dishes);
        let mut ingredients = locked(&self.ingredients);
        let index = ingredients
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Ingredient, name))?;
        for dish in dishes.iter_mut() {
            dish.recipe.remove(name);
        }
        self.bump();
        Ok(ingredients.remove(index))
    }

    /// Replace a dish's recipe wholesale.
    pub fn set_recipe(&self, dish: &str, recipe: Recipe) -> Result<()> {
        let recipe: Recipe = recipe.into_iter().filter(|(_, qty)| *qty > 0).collect();
        self.check_recipe(&recipe)?;
        let mut guard = locked(&self.dishes);
        let entry = guard
            .iter_mut()
            .find(|d| d.name == dish)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Dish, dish))?;
        entry.recipe = recipe;
        self.bump();
        Ok(())
    }

    /// Set one recipe line; a quantity of 0 removes it.
    pub fn set_recipe_line(&self, dish: &str, ingredient: &str, quantity: u64) -> Result<()> {
        if quantity > 0 && self.ingredient(ingredient).is_none() {
            return Err(SupplyError::not_found(EntityKind::Ingredient, ingredient));
        }
        let mut guard = locked(&self.dishes);
        let entry = guard
            .iter_mut()
            .find(|d| d.name == dish)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Dish, dish))?;
        if quantity == 0 {
            entry.recipe.remove(ingredient);
        } else {
            entry.recipe.insert(ingredient.to_string(), quantity);
        }
        self.bump();
        Ok(())
    }

    pub fn set_restock_levels(&self, item: &ItemKey, levels: RestockLevels) -> Result<()> {
        match item.kind {
            ItemKind::Dish => {
                let mut guard = locked(&self.dishes);
                let dish = guard
                    .iter_mut()
                    .find(|d| d.name == item.name)
                    .ok_or_else(|| SupplyError::not_found(EntityKind::Dish, &item.name))?;
                dish.restock = levels;
            }
            ItemKind::Ingredient => {
                let mut guard = locked(&self.ingredients);
                let ingredient = guard
                    .iter_mut()
                    .find(|i| i.name == item.name)
                    .ok_or_else(|| SupplyError::not_found(EntityKind::Ingredient, &item.name))?;
                ingredient.restock = levels;
            }
        }
        Ok(())
    }

    pub fn add_supplier(&self, supplier: Supplier) -> Result<()> {
        let mut guard = locked(&self.suppliers);
        if guard.iter().any(|s| s.name == supplier.name) {
            return Err(SupplyError::already_exists(EntityKind::Supplier, supplier.name));
        }
        guard.push(supplier);
        Ok(())
    }

    /// Suppliers still referenced by an ingredient cannot be removed.
    pub fn remove_supplier(&self, name: &str) -> Result<Supplier> {
        if let Some(user) = locked(&self.ingredients)
            .iter()
            .find(|i| i.supplier == name)
        {
            return Err(SupplyError::Invalid(format!(
                "supplier \"{name}\" still supplies \"{}\"",
                user.name
            )));
        }
        let mut guard = locked(&self.suppliers);
        let index = guard
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Supplier, name))?;
        Ok(guard.remove(index))
    }

    pub fn add_postcode(&self, postcode: Postcode) -> Result<()> {
        let mut guard = locked(&self.postcodes);
        if guard.iter().any(|p| p.name == postcode.name) {
            return Err(SupplyError::already_exists(EntityKind::Postcode, postcode.name));
        }
        guard.push(postcode);
        Ok(())
    }

    pub fn remove_postcode(&self, name: &str) -> Result<Postcode> {
        let mut guard = locked(&self.postcodes);
        let index = guard
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| SupplyError::not_found(EntityKind::Postcode, name))?;
        Ok(guard.remove(index))
    }

    /// Re-measure every stored location against a new restaurant.
    pub fn remeasure(&self, origin: &Postcode) {
        for postcode in locked(&self.postcodes).iter_mut() {
            postcode.distance = postcode.distance_to(origin);
        }
        for supplier in locked(&self.suppliers).iter_mut() {
            supplier.postcode.distance = supplier.postcode.distance_to(origin);
        }
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stocked() -> Catalog {
        let catalog = Catalog::new();
        catalog
            .add_supplier(Supplier::new("Fish Co", Postcode::new("SO14 0AA", 50.90, -1.40)))
            .expect("supplier");
        for name in ["Rice", "Nori"] {
            catalog
                .add_ingredient(Ingredient::new(name, "g", "Fish Co", 50, 100, 1.0))
                .expect("ingredient");
        }
        catalog
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let catalog = stocked();
        let err = catalog
            .add_ingredient(Ingredient::new("Rice", "g", "Fish Co", 1, 1, 1.0))
            .unwrap_err();
        assert!(matches!(err, SupplyError::AlreadyExists { kind: EntityKind::Ingredient, .. }));
    }

    #[test]
    fn recipes_must_name_known_ingredients() {
        let catalog = stocked();
        let dish = Dish::new("Maki", "", 3.0, 5, 10).with_ingredient("Salmon", 1);
        let err = catalog.add_dish(dish).unwrap_err();
        assert!(matches!(err, SupplyError::NotFound { kind: EntityKind::Ingredient, .. }));
    }

    #[test]
    fn edits_bump_the_version() {
        let catalog = stocked();
        let (seen, _) = catalog.dishes();
        assert!(catalog.ensure_version(seen).is_ok());
        catalog
            .add_dish(Dish::new("Maki", "", 3.0, 5, 10).with_ingredient("Rice", 2))
            .expect("dish");
        assert!(matches!(
            catalog.ensure_version(seen),
            Err(SupplyError::ConcurrentMutation)
        ));
    }

    #[test]
    fn zero_quantity_removes_recipe_line() {
        let catalog = stocked();
        catalog
            .add_dish(Dish::new("Maki", "", 3.0, 5, 10).with_ingredient("Rice", 2))
            .expect("dish");
        catalog.set_recipe_line("Maki", "Nori", 1).expect("add nori");
        catalog.set_recipe_line("Maki", "Rice", 0).expect("drop rice");
        let recipe = catalog.dish("Maki").expect("maki").recipe;
        assert_eq!(recipe, Recipe::from([("Nori".to_string(), 1)]));
    }

    #[test]
    fn removing_an_ingredient_strips_recipes() {
        let catalog = stocked();
        catalog
            .add_dish(Dish::new("Maki", "", 3.0, 5, 10).with_ingredient("Rice", 2))
            .expect("dish");
        catalog.remove_ingredient("Rice").expect("remove");
        assert!(catalog.dish("Maki").expect("maki").recipe.is_empty());
        assert!(catalog.remove_ingredient("Rice").is_err());
    }

    #[test]
    fn suppliers_in_use_cannot_be_removed() {
        let catalog = stocked();
        assert!(matches!(
            catalog.remove_supplier("Fish Co"),
            Err(SupplyError::Invalid(_))
        ));
    }
}
