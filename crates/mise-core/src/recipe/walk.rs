use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use mise_db::models::{Recipe, RecipeStep};
use uuid::Uuid;

use super::{PrepTaskWithSteps, RecipeGraph, RecipeGraphError};
use crate::schedule;

/// A validated recipe with its steps in executable order.
///
/// Steps are ordered topologically over product edges (producer before
/// consumer). Among steps whose dependencies are met, the lowest declared
/// index goes first, so a recipe without product links keeps its declared
/// order.
#[derive(Debug, Clone)]
pub struct RecipeWalk {
    recipe: Recipe,
    order: Vec<RecipeStep>,
    successors: HashMap<Uuid, Vec<Uuid>>,
    prep_tasks: Vec<PrepTaskWithSteps>,
    /// Step id -> prep task that fully replaces it at serving time.
    satisfied_by: HashMap<Uuid, Uuid>,
}

impl RecipeWalk {
    pub fn new(graph: RecipeGraph) -> Result<Self, RecipeGraphError> {
        let RecipeGraph {
            recipe,
            mut steps,
            products,
            ingredients,
            instruments,
            prep_tasks,
        } = graph;

        if steps.is_empty() {
            return Err(RecipeGraphError::NoSteps);
        }
        steps.sort_by_key(|s| s.step_index);
        for pair in steps.windows(2) {
            if pair[0].step_index == pair[1].step_index {
                return Err(RecipeGraphError::DuplicateStepIndex(pair[0].step_index));
            }
        }

        let position: HashMap<Uuid, usize> =
            steps.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
        let producer: HashMap<Uuid, (usize, &str)> = products
            .iter()
            .filter_map(|p| position.get(&p.step_id).map(|&i| (p.id, (i, p.name.as_str()))))
            .collect();

        // Edges producer -> consumer, deduplicated.
        let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
        let consumed = ingredients
            .iter()
            .map(|i| (i.step_id, i.product_id))
            .chain(instruments.iter().map(|i| (i.step_id, i.product_id)));
        for (step_id, product_id) in consumed {
            let (Some(product_id), Some(&consumer)) = (product_id, position.get(&step_id)) else {
                continue;
            };
            let Some(&(from, name)) = producer.get(&product_id) else {
                return Err(RecipeGraphError::DanglingProduct {
                    step_index: steps[consumer].step_index,
                    product_id,
                });
            };
            if from == consumer {
                return Err(RecipeGraphError::SelfReference {
                    step_index: steps[consumer].step_index,
                    product: name.to_owned(),
                });
            }
            edges.insert((from, consumer));
        }

        let n = steps.len();
        let mut indegree = vec![0usize; n];
        let mut out: Vec<Vec<usize>> = vec![Vec::new(); n];
        for &(from, to) in &edges {
            out[from].push(to);
            indegree[to] += 1;
        }

        let mut ready: BinaryHeap<Reverse<(i32, usize)>> = (0..n)
            .filter(|&i| indegree[i] == 0)
            .map(|i| Reverse((steps[i].step_index, i)))
            .collect();
        let mut sorted = Vec::with_capacity(n);
        while let Some(Reverse((_, i))) = ready.pop() {
            sorted.push(i);
            for &next in &out[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    ready.push(Reverse((steps[next].step_index, next)));
                }
            }
        }
        if sorted.len() < n {
            let step_indices = (0..n)
                .filter(|&i| indegree[i] > 0)
                .map(|i| steps[i].step_index)
                .collect();
            return Err(RecipeGraphError::Cycle { step_indices });
        }

        let mut satisfied_by = HashMap::new();
        for prep in &prep_tasks {
            let task = &prep.task;
            if prep.steps.is_empty() {
                return Err(RecipeGraphError::PrepTaskWithoutSteps {
                    name: task.name.clone(),
                });
            }
            if task.min_buffer_seconds < 0 || task.min_buffer_seconds > task.max_buffer_seconds {
                return Err(RecipeGraphError::BufferRange {
                    name: task.name.clone(),
                    min: task.min_buffer_seconds,
                    max: task.max_buffer_seconds,
                });
            }
            if let (Some(min), Some(max)) = (task.min_storage_temp_c, task.max_storage_temp_c) {
                if min > max {
                    return Err(RecipeGraphError::TemperatureRange {
                        name: task.name.clone(),
                        min,
                        max,
                    });
                }
            }
            for link in &prep.steps {
                if !position.contains_key(&link.recipe_step_id) {
                    return Err(RecipeGraphError::UnknownPrepTaskStep {
                        name: task.name.clone(),
                        step: link.recipe_step_id.to_string(),
                    });
                }
                if link.satisfies_recipe_step {
                    satisfied_by.entry(link.recipe_step_id).or_insert(task.id);
                }
            }
        }

        let ids: Vec<Uuid> = steps.iter().map(|s| s.id).collect();
        let successors: HashMap<Uuid, Vec<Uuid>> = out
            .iter()
            .enumerate()
            .map(|(i, next)| (ids[i], next.iter().map(|&j| ids[j]).collect()))
            .collect();
        let mut slots: Vec<Option<RecipeStep>> = steps.into_iter().map(Some).collect();
        let order = sorted.into_iter().filter_map(|i| slots[i].take()).collect();

        let walk = Self {
            recipe,
            order,
            successors,
            prep_tasks,
            satisfied_by,
        };
        // Windows are offsets from serving time, so any anchor will do.
        schedule::schedule_recipe(&walk, DateTime::<Utc>::UNIX_EPOCH)?;
        Ok(walk)
    }

    pub fn recipe(&self) -> &Recipe {
        &self.recipe
    }

    /// Steps in executable order.
    pub fn steps(&self) -> &[RecipeStep] {
        &self.order
    }

    pub fn prep_tasks(&self) -> &[PrepTaskWithSteps] {
        &self.prep_tasks
    }

    /// Steps that consume a product of `step_id`.
    pub fn successors(&self, step_id: Uuid) -> &[Uuid] {
        self.successors
            .get(&step_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Whether a prep task fully replaces executing `step_id` at serving time.
    pub fn satisfies_recipe_step(&self, step_id: Uuid) -> bool {
        self.satisfied_by.contains_key(&step_id)
    }

    /// The prep task that replaces `step_id`, if any.
    pub fn satisfied_by(&self, step_id: Uuid) -> Option<Uuid> {
        self.satisfied_by.get(&step_id).copied()
    }

    /// The concrete steps a prep task covers, in executable order.
    pub fn covered_steps(&self, prep_task_id: Uuid) -> Vec<&RecipeStep> {
        let covered: HashSet<Uuid> = self
            .prep_tasks
            .iter()
            .filter(|p| p.task.id == prep_task_id)
            .flat_map(|p| p.steps.iter().map(|l| l.recipe_step_id))
            .collect();
        self.order.iter().filter(|s| covered.contains(&s.id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{NewPrepTask, NewPrepTaskStep, NewRecipe, NewStep, NewStepInput, ProductRef};
    use mise_db::models::{RecipeStepIngredient, StorageType};

    fn step(preparation: &str) -> NewStep {
        NewStep {
            preparation: preparation.to_owned(),
            ..NewStep::default()
        }
    }

    fn uses(step: usize, product: &str) -> NewStepInput {
        NewStepInput {
            name: product.to_owned(),
            from: Some(ProductRef {
                step,
                product: product.to_owned(),
            }),
        }
    }

    fn indices(walk: &RecipeWalk) -> Vec<i32> {
        walk.steps().iter().map(|s| s.step_index).collect()
    }

    #[test]
    fn unlinked_steps_keep_declared_order() {
        let recipe = NewRecipe {
            name: "salad".into(),
            steps: vec![step("wash"), step("chop"), step("toss")],
            prep_tasks: vec![],
        };
        let walk = RecipeWalk::new(recipe.into_graph(Utc::now()).unwrap()).unwrap();
        assert_eq!(indices(&walk), vec![0, 1, 2]);
    }

    #[test]
    fn product_edges_order_producer_first() {
        // Step 0 consumes the sauce produced by step 2.
        let mut plate = step("plate");
        plate.ingredients.push(uses(2, "sauce"));
        let mut sauce = step("make sauce");
        sauce.products.push("sauce".into());
        let recipe = NewRecipe {
            name: "pasta".into(),
            steps: vec![plate, step("boil"), sauce],
            prep_tasks: vec![],
        };
        let graph = recipe.into_graph(Utc::now()).unwrap();
        let sauce_id = graph.steps[2].id;
        let plate_id = graph.steps[0].id;
        let walk = RecipeWalk::new(graph).unwrap();
        assert_eq!(indices(&walk), vec![1, 2, 0]);
        assert_eq!(walk.successors(sauce_id), &[plate_id]);
        assert!(walk.successors(plate_id).is_empty());
    }

    #[test]
    fn cycle_is_rejected() {
        let mut a = step("a");
        a.products.push("x".into());
        a.ingredients.push(uses(1, "y"));
        let mut b = step("b");
        b.products.push("y".into());
        b.instruments.push(uses(0, "x"));
        let recipe = NewRecipe {
            name: "loop".into(),
            steps: vec![a, b, step("c")],
            prep_tasks: vec![],
        };
        let err = RecipeWalk::new(recipe.into_graph(Utc::now()).unwrap()).unwrap_err();
        assert_eq!(err, RecipeGraphError::Cycle { step_indices: vec![0, 1] });
    }

    #[test]
    fn self_reference_is_rejected() {
        let mut a = step("reduce");
        a.products.push("stock".into());
        a.ingredients.push(uses(0, "stock"));
        let recipe = NewRecipe {
            name: "stock".into(),
            steps: vec![a],
            prep_tasks: vec![],
        };
        let err = RecipeWalk::new(recipe.into_graph(Utc::now()).unwrap()).unwrap_err();
        assert!(matches!(err, RecipeGraphError::SelfReference { step_index: 0, .. }));
    }

    #[test]
    fn dangling_product_is_rejected() {
        let recipe = NewRecipe {
            name: "orphan".into(),
            steps: vec![step("only")],
            prep_tasks: vec![],
        };
        let mut graph = recipe.into_graph(Utc::now()).unwrap();
        let missing = Uuid::new_v4();
        graph.ingredients.push(RecipeStepIngredient {
            id: Uuid::new_v4(),
            step_id: graph.steps[0].id,
            name: "ghost".into(),
            product_id: Some(missing),
        });
        let err = RecipeWalk::new(graph).unwrap_err();
        assert_eq!(
            err,
            RecipeGraphError::DanglingProduct {
                step_index: 0,
                product_id: missing
            }
        );
    }

    #[test]
    fn empty_recipe_is_rejected() {
        let recipe = NewRecipe {
            name: "nothing".into(),
            steps: vec![],
            prep_tasks: vec![],
        };
        let err = RecipeWalk::new(recipe.into_graph(Utc::now()).unwrap()).unwrap_err();
        assert_eq!(err, RecipeGraphError::NoSteps);
    }

    fn prep(name: &str, steps: Vec<NewPrepTaskStep>) -> NewPrepTask {
        NewPrepTask {
            name: name.into(),
            notes: String::new(),
            storage_type: StorageType::Covered,
            storage_instructions: String::new(),
            min_buffer_seconds: 3600,
            max_buffer_seconds: 86400,
            min_storage_temp_c: Some(2.0),
            max_storage_temp_c: Some(6.0),
            steps,
        }
    }

    #[test]
    fn satisfies_recipe_step_follows_prep_task_links() {
        let recipe = NewRecipe {
            name: "focaccia".into(),
            steps: vec![step("mix"), step("proof"), step("bake")],
            prep_tasks: vec![prep(
                "make dough",
                vec![
                    NewPrepTaskStep { step: 0, satisfies_recipe_step: true },
                    NewPrepTaskStep { step: 1, satisfies_recipe_step: false },
                ],
            )],
        };
        let graph = recipe.into_graph(Utc::now()).unwrap();
        let ids: Vec<Uuid> = graph.steps.iter().map(|s| s.id).collect();
        let prep_id = graph.prep_tasks[0].task.id;
        let walk = RecipeWalk::new(graph).unwrap();

        assert!(walk.satisfies_recipe_step(ids[0]));
        assert!(!walk.satisfies_recipe_step(ids[1]));
        assert!(!walk.satisfies_recipe_step(ids[2]));
        let covered: Vec<i32> = walk.covered_steps(prep_id).iter().map(|s| s.step_index).collect();
        assert_eq!(covered, vec![0, 1]);
    }

    #[test]
    fn prep_task_validation() {
        let empty = NewRecipe {
            name: "r".into(),
            steps: vec![step("a")],
            prep_tasks: vec![prep("nothing", vec![])],
        };
        assert!(matches!(
            RecipeWalk::new(empty.into_graph(Utc::now()).unwrap()),
            Err(RecipeGraphError::PrepTaskWithoutSteps { .. })
        ));

        let mut inverted = prep("backwards", vec![NewPrepTaskStep { step: 0, satisfies_recipe_step: true }]);
        inverted.min_buffer_seconds = 7200;
        inverted.max_buffer_seconds = 60;
        let recipe = NewRecipe {
            name: "r".into(),
            steps: vec![step("a")],
            prep_tasks: vec![inverted],
        };
        assert!(matches!(
            RecipeWalk::new(recipe.into_graph(Utc::now()).unwrap()),
            Err(RecipeGraphError::BufferRange { min: 7200, max: 60, .. })
        ));

        let mut cold = prep("cold", vec![NewPrepTaskStep { step: 0, satisfies_recipe_step: true }]);
        cold.min_storage_temp_c = Some(8.0);
        cold.max_storage_temp_c = Some(4.0);
        let recipe = NewRecipe {
            name: "r".into(),
            steps: vec![step("a")],
            prep_tasks: vec![cold],
        };
        assert!(matches!(
            RecipeWalk::new(recipe.into_graph(Utc::now()).unwrap()),
            Err(RecipeGraphError::TemperatureRange { .. })
        ));
    }
}
