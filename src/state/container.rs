//! Generic batched state container

use super::field::{Field, Item};
use super::selector::Selector;
use crate::error::{Error, Result};
use numr::autograd::Var;
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A set of named fields that all share one leading batch dimension.
///
/// The schema is whatever fields have been set; there is no declared type.
/// Fields can be tensors, host lists or nested states (see [`Field`]).
///
/// `clone()` is a shallow copy: tensors and list storage are shared. Writes
/// through [`State::assign`] or [`State::list_mut`] never leak into other
/// copies because lists are copy-on-write and tensors are replaced rather than
/// written in place.
pub struct State<R: Runtime> {
    fields: BTreeMap<String, Field<R>>,
}

impl<R: Runtime> Clone for State<R> {
    fn clone(&self) -> Self {
        Self {
            fields: self.fields.clone(),
        }
    }
}

impl<R: Runtime> Default for State<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> std::fmt::Debug for State<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.fields.iter()).finish()
    }
}

impl<R: Runtime> State<R> {
    pub fn new() -> Self {
        Self {
            fields: BTreeMap::new(),
        }
    }

    /// Builder form of [`State::set`].
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Field<R>>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Add or replace a field.
    ///
    /// The value's batch size must match every other field's. Replacing the
    /// only sized field may change the batch size.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Field<R>>) -> Result<()> {
        let name = name.into();
        let value = value.into();
        if let Some(got) = value.batch_size(&name)? {
            if let Some(expected) = self.batch_size_excluding(&name) {
                if expected != got {
                    return Err(Error::ShapeMismatch {
                        field: name,
                        expected,
                        got,
                    });
                }
            }
        }
        self.fields.insert(name, value);
        Ok(())
    }

    /// Remove a field, returning it.
    pub fn remove(&mut self, name: &str) -> Result<Field<R>> {
        self.fields.remove(name).ok_or_else(|| Error::FieldNotFound {
            name: name.to_string(),
        })
    }

    pub fn get(&self, name: &str) -> Result<&Field<R>> {
        self.fields.get(name).ok_or_else(|| Error::FieldNotFound {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Tensor field by name.
    pub fn tensor(&self, name: &str) -> Result<&Var<R>> {
        match self.get(name)? {
            Field::Tensor(v) => Ok(v),
            other => Err(wrong_kind(name, other, "tensor")),
        }
    }

    /// List field by name.
    pub fn list(&self, name: &str) -> Result<&[Item]> {
        match self.get(name)? {
            Field::List(items) => Ok(items.as_slice()),
            other => Err(wrong_kind(name, other, "list")),
        }
    }

    /// Mutable access to a list field's items.
    ///
    /// Storage shared with other copies is cloned first. The length is fixed,
    /// so the batch size cannot change through this.
    pub fn list_mut(&mut self, name: &str) -> Result<&mut [Item]> {
        match self.fields.get_mut(name) {
            Some(Field::List(items)) => Ok(Arc::make_mut(items).as_mut_slice()),
            Some(other) => Err(wrong_kind(name, other, "list")),
            None => Err(Error::FieldNotFound {
                name: name.to_string(),
            }),
        }
    }

    /// Nested state by name.
    pub fn state(&self, name: &str) -> Result<&State<R>> {
        match self.get(name)? {
            Field::State(s) => Ok(s),
            other => Err(wrong_kind(name, other, "state")),
        }
    }

    /// Mutable nested state by name.
    ///
    /// Writes into the nested state are checked against its own fields only;
    /// callers keep its batch size in line with the parent.
    pub fn state_mut(&mut self, name: &str) -> Result<&mut State<R>> {
        match self.fields.get_mut(name) {
            Some(Field::State(s)) => Ok(s),
            Some(other) => Err(wrong_kind(name, other, "state")),
            None => Err(Error::FieldNotFound {
                name: name.to_string(),
            }),
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Shared leading dimension; `None` while no sized field is present.
    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size_excluding("")
    }

    fn batch_size_excluding(&self, skip: &str) -> Option<usize> {
        self.fields
            .iter()
            .filter(|(k, _)| k.as_str() != skip)
            .find_map(|(k, f)| f.batch_size(k).ok().flatten())
    }

    fn require_batch(&self) -> usize {
        self.batch_size().unwrap_or(0)
    }

    /// Copy the state.
    ///
    /// - `detach`: tensor fields no longer track gradients in the copy
    /// - `deep`: list storage is duplicated instead of shared
    ///
    /// Nested states are copied recursively with the same flags.
    pub fn copy(&self, detach: bool, deep: bool) -> Self {
        Self {
            fields: self
                .fields
                .iter()
                .map(|(k, f)| (k.clone(), f.duplicate(detach, deep)))
                .collect(),
        }
    }

    fn same_schema(&self, other: &State<R>) -> Result<()> {
        if !self.fields.keys().eq(other.fields.keys()) {
            return Err(Error::SchemaMismatch {
                reason: format!(
                    "fields {:?} vs {:?}",
                    self.field_names().collect::<Vec<_>>(),
                    other.field_names().collect::<Vec<_>>()
                ),
            });
        }
        Ok(())
    }
}

impl<R: Runtime<DType = DType>> State<R> {
    /// New state holding the selected examples of every field.
    ///
    /// The result always keeps the batch dimension, even for a single index.
    pub fn index<C>(&self, selector: impl Into<Selector>, client: &C) -> Result<Self>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let rows = selector.into().resolve(self.require_batch())?;
        self.select_rows(&rows, client)
    }

    pub(crate) fn select_rows<C>(&self, rows: &[usize], client: &C) -> Result<Self>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let mut fields = BTreeMap::new();
        for (name, field) in &self.fields {
            fields.insert(name.clone(), field.select(rows, client)?);
        }
        Ok(Self { fields })
    }

    /// Overwrite the selected examples with the rows of `other`, in order.
    ///
    /// Only the fields `other` carries are written; each must exist here and
    /// hold one example per selected position. When a position is selected
    /// twice the later row wins. On error the state is left untouched.
    pub fn assign<C>(&mut self, selector: impl Into<Selector>, other: &State<R>, client: &C) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let rows = selector.into().resolve(self.require_batch())?;
        self.assign_rows(&rows, other, client)
    }

    pub(crate) fn assign_rows<C>(&mut self, rows: &[usize], other: &State<R>, client: &C) -> Result<()>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        for (name, field) in &other.fields {
            if !self.fields.contains_key(name) {
                return Err(Error::FieldNotFound { name: name.clone() });
            }
            if let Some(got) = field.batch_size(name)? {
                if got != rows.len() {
                    return Err(Error::ShapeMismatch {
                        field: name.clone(),
                        expected: rows.len(),
                        got,
                    });
                }
            }
        }

        let mut updated = self.fields.clone();
        for (name, src) in &other.fields {
            if let Some(field) = updated.get_mut(name) {
                field.overwrite(name, rows, src, client)?;
            }
        }
        self.fields = updated;
        Ok(())
    }

    /// Concatenate states along the batch dimension, in order.
    ///
    /// All states must have the same field names and matching field kinds.
    /// Tensor fields must agree on every non-batch dimension; nothing is padded.
    pub fn merge<C>(states: &[&State<R>], client: &C) -> Result<Self>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let first = states.first().ok_or_else(|| Error::InvalidArgument {
            arg: "states",
            reason: "cannot merge an empty list of states".to_string(),
        })?;
        for s in &states[1..] {
            first.same_schema(s)?;
        }

        let mut fields = BTreeMap::new();
        for name in first.fields.keys() {
            let parts: Vec<&Field<R>> = states
                .iter()
                .map(|s| s.get(name))
                .collect::<Result<_>>()?;
            fields.insert(name.clone(), Field::concat(name, &parts, client)?);
        }
        Ok(Self { fields })
    }
}

fn wrong_kind<R: Runtime>(name: &str, field: &Field<R>, wanted: &str) -> Error {
    Error::SchemaMismatch {
        reason: format!("field '{name}' is a {}, not a {wanted}", field.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::{CpuDevice, CpuRuntime};
    use numr::tensor::Tensor;

    fn scored(device: &CpuDevice, names: &[&str], scores: &[f32]) -> State<CpuRuntime> {
        State::new()
            .with_field("names", Field::list(names.iter().copied()))
            .unwrap()
            .with_field(
                "scores",
                Tensor::<CpuRuntime>::from_slice(scores, &[scores.len()], device),
            )
            .unwrap()
    }

    fn scores_of(s: &State<CpuRuntime>) -> Vec<f32> {
        s.tensor("scores").unwrap().tensor().contiguous().to_vec::<f32>()
    }

    #[test]
    fn test_set_checks_batch_size() {
        let (_client, device) = cpu_setup();
        let mut s = scored(&device, &["a", "b"], &[1.0, 2.0]);
        assert_eq!(s.batch_size(), Some(2));

        let err = s.set("extra", Field::list(["x", "y", "z"])).unwrap_err();
        assert!(matches!(
            err,
            Error::ShapeMismatch {
                expected: 2,
                got: 3,
                ..
            }
        ));

        // empty nested state fits anywhere
        s.set("mstate", State::new()).unwrap();
        assert_eq!(s.batch_size(), Some(2));
    }

    #[test]
    fn test_replacing_only_field_may_resize() {
        let mut s: State<CpuRuntime> = State::new();
        s.set("names", Field::list(["a"])).unwrap();
        s.set("names", Field::list(["a", "b"])).unwrap();
        assert_eq!(s.batch_size(), Some(2));
    }

    #[test]
    fn test_accessors() {
        let (_client, device) = cpu_setup();
        let s = scored(&device, &["a"], &[1.0]);
        assert!(matches!(
            s.get("missing"),
            Err(Error::FieldNotFound { .. })
        ));
        assert!(matches!(
            s.tensor("names"),
            Err(Error::SchemaMismatch { .. })
        ));
        assert_eq!(s.list("names").unwrap()[0], Item::from("a"));
        assert_eq!(s.field_names().collect::<Vec<_>>(), vec!["names", "scores"]);
    }

    #[test]
    fn test_index_keeps_batch_dim() {
        let (client, device) = cpu_setup();
        let s = scored(&device, &["a", "b", "c"], &[1.0, 2.0, 3.0]);

        let one = s.index(1, &client).unwrap();
        assert_eq!(one.batch_size(), Some(1));
        assert_eq!(one.tensor("scores").unwrap().shape(), &[1]);
        assert_eq!(scores_of(&one), vec![2.0]);

        let last = s.index(Selector::Index(-1), &client).unwrap();
        assert_eq!(last.list("names").unwrap()[0], Item::from("c"));

        let picked = s.index(vec![2usize, 0], &client).unwrap();
        assert_eq!(scores_of(&picked), vec![3.0, 1.0]);

        let masked = s.index(vec![false, true, true], &client).unwrap();
        assert_eq!(scores_of(&masked), vec![2.0, 3.0]);

        assert!(matches!(
            s.index(5, &client),
            Err(Error::IndexOutOfRange { batch_size: 3, .. })
        ));
    }

    #[test]
    fn test_index_equals_merge_of_singletons() {
        let (client, device) = cpu_setup();
        let s = scored(&device, &["a", "b", "c", "d"], &[1.0, 2.0, 3.0, 4.0]);

        let direct = s.index(vec![3usize, 1], &client).unwrap();
        let a = s.index(3, &client).unwrap();
        let b = s.index(1, &client).unwrap();
        let merged = State::merge(&[&a, &b], &client).unwrap();

        assert_eq!(scores_of(&direct), scores_of(&merged));
        assert_eq!(direct.list("names").unwrap(), merged.list("names").unwrap());
    }

    #[test]
    fn test_assign_then_index() {
        let (client, device) = cpu_setup();
        let mut s = scored(&device, &["a", "b", "c"], &[1.0, 2.0, 3.0]);
        let patch = scored(&device, &["x", "y"], &[9.0, 8.0]);

        s.assign(vec![2usize, 0], &patch, &client).unwrap();
        assert_eq!(scores_of(&s), vec![8.0, 2.0, 9.0]);

        let back = s.index(vec![2usize, 0], &client).unwrap();
        assert_eq!(scores_of(&back), vec![9.0, 8.0]);
        assert_eq!(
            back.list("names").unwrap(),
            &[Item::from("x"), Item::from("y")]
        );
    }

    #[test]
    fn test_assign_errors_leave_state_untouched() {
        let (client, device) = cpu_setup();
        let mut s = scored(&device, &["a", "b", "c"], &[1.0, 2.0, 3.0]);

        let wrong_rows = scored(&device, &["x"], &[9.0]);
        assert!(matches!(
            s.assign(vec![0usize, 1], &wrong_rows, &client),
            Err(Error::ShapeMismatch { .. })
        ));

        let extra = scored(&device, &["x"], &[9.0])
            .with_field("bogus", Field::list([true]))
            .unwrap();
        assert!(matches!(
            s.assign(0, &extra, &client),
            Err(Error::FieldNotFound { .. })
        ));
        assert_eq!(scores_of(&s), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_assign_subset_of_fields() {
        let (client, device) = cpu_setup();
        let mut s = scored(&device, &["a", "b"], &[1.0, 2.0]);
        let names_only = State::new()
            .with_field("names", Field::list(["z"]))
            .unwrap();

        s.assign(1, &names_only, &client).unwrap();
        assert_eq!(
            s.list("names").unwrap(),
            &[Item::from("a"), Item::from("z")]
        );
        assert_eq!(scores_of(&s), vec![1.0, 2.0]);
    }

    #[test]
    fn test_assign_with_empty_nested_state() {
        let (client, device) = cpu_setup();
        let cached = State::new()
            .with_field("ctx", Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0], &[3], &device))
            .unwrap();
        let mut x = State::new()
            .with_field("names", Field::list(["a", "b", "c"]))
            .unwrap()
            .with_field("mstate", cached)
            .unwrap();

        // an empty nested state provides nothing to write
        let fresh = State::new()
            .with_field("names", Field::list(["z"]))
            .unwrap()
            .with_field("mstate", State::new())
            .unwrap();
        x.assign(1, &fresh, &client).unwrap();
        assert_eq!(x.list("names").unwrap()[1], Item::from("z"));
        let ctx = x.state("mstate").unwrap().tensor("ctx").unwrap();
        assert_eq!(ctx.tensor().contiguous().to_vec::<f32>(), vec![1.0, 2.0, 3.0]);

        // a populated nested state cannot write into an empty one
        let mut y = State::new()
            .with_field("names", Field::list(["a", "b"]))
            .unwrap()
            .with_field("mstate", State::new())
            .unwrap();
        let patch = State::new()
            .with_field("names", Field::list(["z"]))
            .unwrap()
            .with_field(
                "mstate",
                State::new()
                    .with_field("ctx", Tensor::<CpuRuntime>::from_slice(&[9.0f32], &[1], &device))
                    .unwrap(),
            )
            .unwrap();
        match y.assign(0, &patch, &client) {
            Err(Error::FieldNotFound { name }) => assert_eq!(name, "mstate.ctx"),
            other => panic!("expected FieldNotFound, got {other:?}"),
        }
        assert_eq!(y.list("names").unwrap()[0], Item::from("a"));
    }

    #[test]
    fn test_merge() {
        let (client, device) = cpu_setup();
        let a = scored(&device, &["a", "b", "c"], &[1.0, 2.0, 3.0]);
        let b = scored(&device, &["d", "e"], &[4.0, 5.0]);

        let merged = State::merge(&[&a, &b], &client).unwrap();
        assert_eq!(merged.batch_size(), Some(5));
        assert_eq!(scores_of(&merged), vec![1.0, 2.0, 3.0, 4.0, 5.0]);

        let c = State::new().with_field("names", Field::list(["z"])).unwrap();
        assert!(matches!(
            State::merge(&[&a, &c], &client),
            Err(Error::SchemaMismatch { .. })
        ));
        assert!(State::<CpuRuntime>::merge(&[], &client).is_err());
    }

    #[test]
    fn test_shallow_copy_is_isolated_from_writes() {
        let (client, device) = cpu_setup();
        let original = scored(&device, &["a", "b"], &[1.0, 2.0]);
        let mut copy = original.copy(false, false);

        let patch = scored(&device, &["z"], &[7.0]);
        copy.assign(0, &patch, &client).unwrap();
        copy.list_mut("names").unwrap()[1] = Item::from("q");

        assert_eq!(scores_of(&original), vec![1.0, 2.0]);
        assert_eq!(
            original.list("names").unwrap(),
            &[Item::from("a"), Item::from("b")]
        );
        assert_eq!(scores_of(&copy), vec![7.0, 2.0]);
    }

    #[test]
    fn test_nested_state_follows_selection() {
        let (client, device) = cpu_setup();
        let inner = scored(&device, &["p", "q"], &[10.0, 20.0]);
        let outer = State::new()
            .with_field("ids", Field::list([1i64, 2]))
            .unwrap()
            .with_field("inner", inner)
            .unwrap();

        let picked = outer.index(1, &client).unwrap();
        let nested = picked.state("inner").unwrap();
        assert_eq!(scores_of(nested), vec![20.0]);
    }

    #[test]
    fn test_detached_copy() {
        let (_client, device) = cpu_setup();
        let mut s: State<CpuRuntime> = State::new();
        s.set(
            "w",
            Var::new(
                Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device),
                true,
            ),
        )
        .unwrap();
        let d = s.copy(true, true);
        assert!(!d.tensor("w").unwrap().requires_grad());
        assert!(s.tensor("w").unwrap().requires_grad());
    }
}
