//! Field values and their per-kind row operations
//!
//! Every field kind knows how to select rows, concatenate along the batch
//! dimension, overwrite rows and copy itself. [`State`](super::State) dispatches
//! to these without caring what the field holds.

use super::container::State;
use crate::error::{Error, Result};
use numr::autograd::{Var, var_cat, var_narrow};
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One example's entry in a list field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    /// Raw string
    Text(String),
    /// Token sequence
    Tokens(Vec<String>),
    /// Id sequence
    Ids(Vec<i64>),
    Int(i64),
    Float(f64),
    Flag(bool),
}

impl Item {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Item::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_tokens(&self) -> Option<&[String]> {
        match self {
            Item::Tokens(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_ids(&self) -> Option<&[i64]> {
        match self {
            Item::Ids(ids) => Some(ids),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Item::Flag(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Item {
    fn from(s: &str) -> Self {
        Item::Text(s.to_string())
    }
}

impl From<String> for Item {
    fn from(s: String) -> Self {
        Item::Text(s)
    }
}

impl From<Vec<String>> for Item {
    fn from(t: Vec<String>) -> Self {
        Item::Tokens(t)
    }
}

impl From<Vec<i64>> for Item {
    fn from(ids: Vec<i64>) -> Self {
        Item::Ids(ids)
    }
}

impl From<i64> for Item {
    fn from(v: i64) -> Self {
        Item::Int(v)
    }
}

impl From<f64> for Item {
    fn from(v: f64) -> Self {
        Item::Float(v)
    }
}

impl From<bool> for Item {
    fn from(v: bool) -> Self {
        Item::Flag(v)
    }
}

/// Second handle on `v` under the same id.
///
/// `Var::clone` mints a fresh id, so gradients reaching a cloned leaf would be
/// stored under the clone and never show up for the source.
pub(crate) fn share<R: Runtime>(v: &Var<R>) -> Var<R> {
    if v.requires_grad() {
        Var::with_id_and_grad_fn(v.tensor().clone(), v.id(), v.grad_fn().cloned())
    } else {
        Var::with_id(v.tensor().clone(), v.id(), false)
    }
}

/// A named value inside a [`State`]. Leading dimension is the batch.
pub enum Field<R: Runtime> {
    /// Tensor with batch as dim 0; may carry an autograd graph
    Tensor(Var<R>),
    /// One host item per example. Shared between shallow copies until written.
    List(Arc<Vec<Item>>),
    /// Nested state; may be empty (no batch size yet)
    State(State<R>),
}

impl<R: Runtime> Clone for Field<R> {
    fn clone(&self) -> Self {
        match self {
            Field::Tensor(v) => Field::Tensor(share(v)),
            Field::List(items) => Field::List(Arc::clone(items)),
            Field::State(s) => Field::State(s.clone()),
        }
    }
}

impl<R: Runtime> std::fmt::Debug for Field<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Field::Tensor(v) => write!(f, "Tensor({:?})", v.shape()),
            Field::List(items) => write!(f, "List(len={})", items.len()),
            Field::State(s) => write!(f, "State({:?})", s.field_names().collect::<Vec<_>>()),
        }
    }
}

impl<R: Runtime> From<Var<R>> for Field<R> {
    fn from(v: Var<R>) -> Self {
        Field::Tensor(v)
    }
}

impl<R: Runtime> From<numr::tensor::Tensor<R>> for Field<R> {
    fn from(t: numr::tensor::Tensor<R>) -> Self {
        Field::Tensor(Var::new(t, false))
    }
}

impl<R: Runtime> From<Vec<Item>> for Field<R> {
    fn from(items: Vec<Item>) -> Self {
        Field::List(Arc::new(items))
    }
}

impl<R: Runtime> From<State<R>> for Field<R> {
    fn from(s: State<R>) -> Self {
        Field::State(s)
    }
}

impl<R: Runtime> Field<R> {
    /// Build a list field from anything convertible to items.
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Item>,
    {
        Field::List(Arc::new(items.into_iter().map(Into::into).collect()))
    }

    /// Short kind name, used in schema errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Field::Tensor(_) => "tensor",
            Field::List(_) => "list",
            Field::State(_) => "state",
        }
    }

    /// Leading dimension; `None` for an empty nested state.
    ///
    /// Errors on a 0-dim tensor, which has no batch dimension.
    pub fn batch_size(&self, name: &str) -> Result<Option<usize>> {
        match self {
            Field::Tensor(v) => match v.shape().first() {
                Some(&b) => Ok(Some(b)),
                None => Err(Error::InvalidArgument {
                    arg: "value",
                    reason: format!("field '{name}' is a 0-dim tensor with no batch dimension"),
                }),
            },
            Field::List(items) => Ok(Some(items.len())),
            Field::State(s) => Ok(s.batch_size()),
        }
    }

    /// Copy of this field. `deep` gives lists fresh storage; `detach` cuts
    /// tensors out of the autograd graph.
    pub(crate) fn duplicate(&self, detach: bool, deep: bool) -> Self {
        match self {
            Field::Tensor(v) if detach => Field::Tensor(Var::new(v.tensor().clone(), false)),
            Field::Tensor(v) => Field::Tensor(share(v)),
            Field::List(items) if deep => Field::List(Arc::new(items.as_ref().clone())),
            Field::List(items) => Field::List(Arc::clone(items)),
            Field::State(s) => Field::State(s.copy(detach, deep)),
        }
    }

    /// Rows at `rows`, in that order.
    pub(crate) fn select<C>(&self, rows: &[usize], client: &C) -> Result<Self>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        match self {
            Field::Tensor(v) => {
                let pieces: Vec<RowSource> = rows.iter().map(|&r| RowSource::Own(r)).collect();
                Ok(Field::Tensor(gather_rows(v, None, &pieces, client)?))
            }
            Field::List(items) => Ok(Field::List(Arc::new(
                rows.iter().map(|&r| items[r].clone()).collect(),
            ))),
            Field::State(s) => {
                if s.batch_size().is_none() {
                    return Ok(Field::State(s.clone()));
                }
                Ok(Field::State(s.select_rows(rows, client)?))
            }
        }
    }

    /// Concatenate same-kind fields along the batch dimension.
    pub(crate) fn concat<C>(name: &str, parts: &[&Field<R>], client: &C) -> Result<Self>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let first = parts.first().ok_or_else(|| Error::InvalidArgument {
            arg: "parts",
            reason: format!("nothing to concatenate for field '{name}'"),
        })?;
        for part in parts {
            if part.kind() != first.kind() {
                return Err(Error::SchemaMismatch {
                    reason: format!(
                        "field '{name}' is a {} in one state and a {} in another",
                        first.kind(),
                        part.kind()
                    ),
                });
            }
        }

        match first {
            Field::Tensor(head) => {
                let vars: Vec<&Var<R>> = parts
                    .iter()
                    .filter_map(|p| match p {
                        Field::Tensor(v) => Some(v),
                        _ => None,
                    })
                    .collect();
                for v in &vars {
                    check_row_shape(name, head, v)?;
                }
                if vars.len() == 1 {
                    return Ok(Field::Tensor(share(head)));
                }
                Ok(Field::Tensor(var_cat(&vars, 0, client)?))
            }
            Field::List(_) => {
                let mut merged = Vec::new();
                for part in parts {
                    if let Field::List(items) = part {
                        merged.extend(items.iter().cloned());
                    }
                }
                Ok(Field::List(Arc::new(merged)))
            }
            Field::State(_) => {
                let states: Vec<&State<R>> = parts
                    .iter()
                    .filter_map(|p| match p {
                        Field::State(s) => Some(s),
                        _ => None,
                    })
                    .collect();
                Ok(Field::State(State::merge(&states, client)?))
            }
        }
    }

    /// Replace this field with one where `rows[j]` takes row `j` of `src`.
    /// Later duplicates in `rows` win.
    pub(crate) fn overwrite<C>(
        &mut self,
        name: &str,
        rows: &[usize],
        src: &Field<R>,
        client: &C,
    ) -> Result<()>
    where
        R: Runtime<DType = DType>,
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        match (&mut *self, src) {
            (Field::Tensor(dst), Field::Tensor(other)) => {
                check_row_shape(name, dst, other)?;
                let mut sources: Vec<RowSource> = (0..dst.shape()[0]).map(RowSource::Own).collect();
                for (j, &r) in rows.iter().enumerate() {
                    sources[r] = RowSource::Other(j);
                }
                let updated = gather_rows(dst, Some(other), &sources, client)?;
                *dst = updated;
                Ok(())
            }
            (Field::List(dst), Field::List(other)) => {
                let items = Arc::make_mut(dst);
                for (j, &r) in rows.iter().enumerate() {
                    items[r] = other[j].clone();
                }
                Ok(())
            }
            (Field::State(dst), Field::State(other)) => {
                match (dst.batch_size(), other.batch_size()) {
                    // nothing provided, nothing written
                    (_, None) => Ok(()),
                    (Some(_), Some(_)) => dst.assign_rows(rows, other, client),
                    (None, Some(_)) => {
                        let missing = other.field_names().next().unwrap_or_default();
                        Err(Error::FieldNotFound {
                            name: format!("{name}.{missing}"),
                        })
                    }
                }
            }
            (dst, src) => Err(Error::SchemaMismatch {
                reason: format!(
                    "cannot assign a {} into {} field '{name}'",
                    src.kind(),
                    dst.kind()
                ),
            }),
        }
    }
}

/// Where one output row comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowSource {
    Own(usize),
    Other(usize),
}

/// Assemble a tensor row by row from `base` and `other`.
///
/// Consecutive rows from the same source are taken as one narrowed slice, so a
/// contiguous selection costs a single `narrow` and keeps the autograd graph.
fn gather_rows<R, C>(
    base: &Var<R>,
    other: Option<&Var<R>>,
    sources: &[RowSource],
    client: &C,
) -> Result<Var<R>>
where
    R: Runtime<DType = DType>,
    C: RuntimeClient<R> + TensorOps<R>,
    R::Client: TensorOps<R>,
{
    let mut runs: Vec<(RowSource, usize)> = Vec::new();
    for &src in sources {
        match runs.last_mut() {
            Some((start, len)) if continues(*start, *len, src) => *len += 1,
            _ => runs.push((src, 1)),
        }
    }

    let mut slices = Vec::with_capacity(runs.len());
    for (start, len) in runs {
        let (var, first) = match start {
            RowSource::Own(r) => (base, r),
            RowSource::Other(r) => match other {
                Some(o) => (o, r),
                None => {
                    return Err(Error::InvalidArgument {
                        arg: "sources",
                        reason: "row taken from a missing source tensor".to_string(),
                    });
                }
            },
        };
        slices.push(var_narrow(var, 0, first, len)?);
    }

    if slices.len() == 1 {
        return Ok(settle(slices.remove(0)));
    }
    let refs: Vec<&Var<R>> = slices.iter().collect();
    Ok(var_cat(&refs, 0, client)?)
}

fn continues(start: RowSource, len: usize, next: RowSource) -> bool {
    match (start, next) {
        (RowSource::Own(a), RowSource::Own(b)) | (RowSource::Other(a), RowSource::Other(b)) => {
            b == a + len
        }
        _ => false,
    }
}

/// Materialize a narrowed view when nothing tracks gradients through it.
fn settle<R: Runtime>(v: Var<R>) -> Var<R> {
    if v.requires_grad() || v.tensor().is_contiguous() {
        v
    } else {
        Var::new(v.tensor().contiguous(), false)
    }
}

/// Non-batch dims must agree.
fn check_row_shape<R: Runtime>(name: &str, expected: &Var<R>, got: &Var<R>) -> Result<()> {
    let e = expected.shape();
    let g = got.shape();
    if e.len() != g.len() {
        return Err(Error::ShapeMismatch {
            field: name.to_string(),
            expected: e.len(),
            got: g.len(),
        });
    }
    for (a, b) in e.iter().zip(g.iter()).skip(1) {
        if a != b {
            return Err(Error::ShapeMismatch {
                field: name.to_string(),
                expected: *a,
                got: *b,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;
    use numr::tensor::Tensor;

    fn tensor_field(data: &[f32], shape: &[usize]) -> Field<CpuRuntime> {
        let (_client, device) = cpu_setup();
        Field::from(Tensor::<CpuRuntime>::from_slice(data, shape, &device))
    }

    fn values(f: &Field<CpuRuntime>) -> Vec<f32> {
        match f {
            Field::Tensor(v) => v.tensor().contiguous().to_vec::<f32>(),
            other => panic!("expected tensor, got {other:?}"),
        }
    }

    #[test]
    fn test_select_rows_in_order() {
        let (client, _device) = cpu_setup();
        let f = tensor_field(&[0.0, 1.0, 10.0, 11.0, 20.0, 21.0], &[3, 2]);

        let picked = f.select(&[2, 0], &client).unwrap();
        assert_eq!(values(&picked), vec![20.0, 21.0, 0.0, 1.0]);

        let run = f.select(&[1, 2], &client).unwrap();
        assert_eq!(values(&run), vec![10.0, 11.0, 20.0, 21.0]);

        let repeated = f.select(&[1, 1], &client).unwrap();
        assert_eq!(values(&repeated), vec![10.0, 11.0, 10.0, 11.0]);
    }

    #[test]
    fn test_overwrite_last_write_wins() {
        let (client, _device) = cpu_setup();
        let mut f = tensor_field(&[0.0, 1.0, 2.0], &[3]);
        let src = tensor_field(&[7.0, 8.0], &[2]);

        f.overwrite("x", &[1, 1], &src, &client).unwrap();
        assert_eq!(values(&f), vec![0.0, 8.0, 2.0]);
    }

    #[test]
    fn test_overwrite_list_is_copy_on_write() {
        let (client, _device) = cpu_setup();
        let original: Field<CpuRuntime> = Field::list(["a", "b"]);
        let mut copy = original.duplicate(false, false);
        let src: Field<CpuRuntime> = Field::list(["z"]);

        copy.overwrite("names", &[0], &src, &client).unwrap();

        match (&original, &copy) {
            (Field::List(a), Field::List(b)) => {
                assert_eq!(a[0], Item::from("a"));
                assert_eq!(b[0], Item::from("z"));
            }
            _ => panic!("expected lists"),
        }
    }

    #[test]
    fn test_concat_rejects_kind_and_shape_mismatch() {
        let (client, _device) = cpu_setup();
        let t = tensor_field(&[1.0, 2.0], &[1, 2]);
        let l: Field<CpuRuntime> = Field::list(["a"]);
        assert!(matches!(
            Field::concat("x", &[&t, &l], &client),
            Err(Error::SchemaMismatch { .. })
        ));

        let wide = tensor_field(&[1.0, 2.0, 3.0], &[1, 3]);
        assert!(matches!(
            Field::concat("x", &[&t, &wide], &client),
            Err(Error::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_detach_drops_grad() {
        let (_client, device) = cpu_setup();
        let v = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0], &[2], &device),
            true,
        );
        let id = v.id();
        let f = Field::Tensor(v);
        match f.duplicate(true, false) {
            Field::Tensor(d) => {
                assert!(!d.requires_grad());
                assert_eq!(d.tensor().to_vec::<f32>(), vec![1.0, 2.0]);
            }
            _ => panic!("expected tensor"),
        }
        match f.duplicate(false, true) {
            Field::Tensor(d) => {
                assert!(d.requires_grad());
                assert_eq!(d.id(), id);
            }
            _ => panic!("expected tensor"),
        }
        match f.clone() {
            Field::Tensor(c) => assert_eq!(c.id(), id),
            _ => panic!("expected tensor"),
        }
    }

    #[test]
    fn test_zero_dim_tensor_has_no_batch() {
        let f = tensor_field(&[1.0], &[]);
        assert!(f.batch_size("x").is_err());
    }
}
