//! Kitchen staff: keep dish stock topped up.

use std::sync::{Arc, Mutex};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::events::Event;
use crate::gate::{Reservation, below_threshold};
use crate::ledger::StockLedger;
use crate::model::Model;
use crate::types::{Dish, ItemKey, WorkerId};
use crate::worker::{CancelToken, Halt, WorkerCtx, report_failure};

pub const IDLE: &str = "Idle";
const RESTING: &str = "Taking a break to recharge";
const MAX_FATIGUE: f64 = 100.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Staff {
    pub name: String,
    pub fatigue: f64,
    pub status: String,
}

impl Staff {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fatigue: 0.0,
            status: IDLE.to_string(),
        }
    }
}

pub type SharedStaff = Arc<Mutex<Staff>>;

enum Batch {
    Stocked(u64),
    OffMenu,
    Short,
}

/// Ingredient quantities one batch of `dish` uses.
fn recipe_needs(dish: &Dish) -> Vec<(ItemKey, u64)> {
    dish.recipe
        .iter()
        .map(|(ingredient, per_dish)| {
            (
                ItemKey::ingredient(ingredient),
                per_dish.saturating_mul(dish.restock.amount),
            )
        })
        .collect()
}

/// True if one more batch of `dish` (on top of `in_flight`) is wanted and the
/// ingredients for all of them are on hand.
fn can_prepare(ledger: &StockLedger, dish: &Dish, in_flight: u32) -> bool {
    if !below_threshold(ledger.get(&dish.key()), in_flight, dish.restock) {
        return false;
    }
    let batches = u64::from(in_flight) + 1;
    dish.recipe.iter().all(|(ingredient, per_dish)| {
        let needed = per_dish
            .saturating_mul(dish.restock.amount)
            .saturating_mul(batches);
        ledger.get(&ItemKey::ingredient(ingredient)) >= needed
    })
}

pub struct StaffWorker {
    model: Arc<Model>,
    staff: SharedStaff,
    ctx: WorkerCtx,
}

impl StaffWorker {
    pub fn new(model: Arc<Model>, staff: SharedStaff, token: CancelToken) -> Self {
        let name = staff.lock().expect("staff mutex poisoned").name.clone();
        let ctx = model.worker_ctx(WorkerId::Staff(name), token);
        Self { model, staff, ctx }
    }

    pub fn run(self) {
        log::info!("{} on shift", self.ctx.id());
        loop {
            let outcome = self.cycle();
            let idle = match outcome {
                Ok(prepared) => prepared == 0,
                Err(Halt::Cancelled) => break,
                Err(Halt::Failed(err)) => {
                    report_failure(self.ctx.id(), &err);
                    true
                }
            };
            if idle && self.ctx.sleep(self.model.config.idle_poll()).is_err() {
                break;
            }
        }
        log::debug!("{} stopping", self.ctx.id());
    }

    fn cycle(&self) -> Result<usize, Halt> {
        self.ctx.checkpoint()?;
        self.set_status(IDLE);
        if !self.model.restocking_dishes() {
            return Ok(0);
        }
        self.restock_dishes()
    }

    /// One pass over the menu. Returns the number of batches prepared.
    fn restock_dishes(&self) -> Result<usize, Halt> {
        let (version, menu) = self.model.catalog.dishes();
        let mut prepared = 0;
        for listed in &menu {
            loop {
                self.ctx.checkpoint()?;
                self.model.catalog.ensure_version(version)?;
                let Some((dish, reservation)) = self.reserve(&listed.name)? else {
                    break;
                };
                self.prepare(&dish, reservation)?;
                prepared += 1;
            }
        }
        Ok(prepared)
    }

    fn reserve(&self, name: &str) -> Result<Option<(Dish, Reservation<'_>)>, Halt> {
        let Some(dish) = self.model.catalog.dish(name) else {
            return Ok(None);
        };
        let ledger = &self.model.ledger;
        let gate = &self.model.gate;
        // Cheap look without the turn; the real decision is repeated under it.
        if !can_prepare(ledger, &dish, gate.in_flight(&dish.key())) {
            return Ok(None);
        }
        self.ctx.sleep(gate.backoff())?;
        let turn = gate.acquire_turn(self.ctx.token()).ok_or(Halt::Cancelled)?;
        let reservation = turn.decide(&dish.key(), |in_flight| {
            can_prepare(ledger, &dish, in_flight)
        });
        Ok(reservation.map(|reservation| (dish, reservation)))
    }

    fn prepare(&self, dish: &Dish, reservation: Reservation<'_>) -> Result<(), Halt> {
        let config = &self.model.config;
        let secs = rand::thread_rng()
            .gen_range(config.prep_secs_min..=config.prep_secs_max.max(config.prep_secs_min));
        self.set_status(&format!("Preparing {}", dish.name));
        log::debug!("{} preparing {} for {secs}s", self.ctx.id(), dish.name);
        // A cancelled sleep drops the reservation, releasing its slot.
        self.ctx.sleep(config.sim_duration(secs as f64))?;

        let model = &self.model;
        let amount = dish.restock.amount;
        let ingredients = recipe_needs(dish);
        // Ingredients are taken at commit time, so two dishes sharing one
        // ingredient cannot both spend the same units.
        let batch = reservation.commit(|| {
            if model.catalog.dish(&dish.name).is_none() || !model.ledger.is_registered(&dish.key()) {
                return Batch::OffMenu;
            }
            if !model.ledger.take_all(&ingredients) {
                return Batch::Short;
            }
            match model.ledger.add(&dish.key(), amount) {
                Some(level) => Batch::Stocked(level),
                None => {
                    for (ingredient, quantity) in &ingredients {
                        model.ledger.add(ingredient, *quantity);
                    }
                    Batch::OffMenu
                }
            }
        });
        match batch {
            Batch::Stocked(level) => {
                log::debug!("{} stocked {} to {level}", self.ctx.id(), dish.name);
                let staff = self.staff.lock().expect("staff mutex poisoned").name.clone();
                model.events.publish(Event::BatchPrepared {
                    staff,
                    dish: dish.name.clone(),
                    quantity: amount,
                });
                model.touched();
            }
            Batch::OffMenu => log::debug!("{} left the menu before it was ready", dish.name),
            Batch::Short => log::info!(
                "{} threw away a batch of {}: ingredients ran out",
                self.ctx.id(),
                dish.name
            ),
        }
        self.tire(secs as f64)
    }

    fn tire(&self, worked_secs: f64) -> Result<(), Halt> {
        let exhausted = self.update(|staff| {
            staff.fatigue = (staff.fatigue + self.model.config.fatigue_rate * worked_secs)
                .clamp(0.0, MAX_FATIGUE);
            staff.fatigue >= MAX_FATIGUE
        });
        if exhausted {
            self.set_status(RESTING);
            self.ctx
                .sleep(self.model.config.sim_duration(self.model.config.staff_rest_secs as f64))?;
            self.update(|staff| staff.fatigue = 0.0);
            self.set_status(IDLE);
        }
        self.model.touched();
        Ok(())
    }

    fn set_status(&self, status: &str) {
        // Only this worker writes its own status.
        if self.staff.lock().expect("staff mutex poisoned").status == status {
            return;
        }
        self.update(|staff| staff.status = status.to_string());
        self.model.touched();
    }

    /// Mutate the record and publish the new state. The record lock is
    /// released before publishing.
    fn update<R>(&self, f: impl FnOnce(&mut Staff) -> R) -> R {
        let (result, event) = {
            let mut staff = self.staff.lock().expect("staff mutex poisoned");
            let result = f(&mut staff);
            let event = Event::StaffChanged {
                name: staff.name.clone(),
                status: staff.status.clone(),
                fatigue: staff.fatigue,
            };
            (result, event)
        };
        self.model.events.publish(event);
        result
    }
}
