//! Value codec for embedded values and collections of value types.
//!
//! An embedded value has no identity: it is flattened into its owner's
//! columns and compared structurally. The column names come from the
//! owner's [`EmbeddedInfo`], so the same type can be embedded twice under
//! different names.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::field::{EmbeddedInfo, FieldInfo, ValueCollectionInfo};
use crate::row::{FromValue, Row};
use crate::value::Value;

/// A value type that flattens to a fixed list of column values.
pub trait Embeddable: Sized + Clone + PartialEq {
    /// Default columns of the value, in codec order. `#[derive(Embeddable)]`
    /// fills this in; scalars leave it empty and name their column where
    /// they are used.
    const FIELDS: &'static [FieldInfo] = &[];

    /// Values in declaration order.
    fn to_values(&self) -> Vec<Value>;

    /// Rebuild from values in declaration order.
    fn from_values(values: &[Value]) -> Result<Self>;
}

fn arity_error(expected: usize, found: usize) -> Error {
    Error::Type(TypeError {
        expected: "embedded value",
        actual: format!("{} values for {} columns", found, expected),
        column: None,
    })
}

/// Flatten an optional embedded value into `(column, value)` pairs.
///
/// `None` writes NULL to every column.
pub fn encode<T: Embeddable>(info: &EmbeddedInfo, value: Option<&T>) -> Vec<(&'static str, Value)> {
    let values = value.map(Embeddable::to_values).unwrap_or_default();
    info.fields
        .iter()
        .enumerate()
        .map(|(i, field)| (field.column, values.get(i).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Read an embedded value from its owner's row.
///
/// All-NULL columns decode to `None`.
pub fn decode<T: Embeddable>(info: &EmbeddedInfo, row: &Row) -> Result<Option<T>> {
    let values: Vec<Value> = info
        .fields
        .iter()
        .map(|field| row.value_or_null(field.column))
        .collect();
    if values.iter().all(Value::is_null) {
        return Ok(None);
    }
    T::from_values(&values).map(Some)
}

/// Encode collection elements as element rows.
pub fn encode_elements<T: Embeddable>(items: &[T]) -> Vec<Vec<Value>> {
    items.iter().map(Embeddable::to_values).collect()
}

/// Decode auxiliary rows into collection elements.
pub fn decode_elements<T: Embeddable>(info: &ValueCollectionInfo, rows: &[Row]) -> Result<Vec<T>> {
    rows.iter()
        .map(|row| {
            let values: Vec<Value> = info.columns().map(|c| row.value_or_null(c)).collect();
            T::from_values(&values)
        })
        .collect()
}

macro_rules! scalar_embeddable {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Embeddable for $ty {
                fn to_values(&self) -> Vec<Value> {
                    vec![Value::from(self.clone())]
                }

                fn from_values(values: &[Value]) -> Result<Self> {
                    match values {
                        [value] => <$ty>::from_value(value),
                        _ => Err(arity_error(1, values.len())),
                    }
                }
            }
        )*
    };
}

scalar_embeddable!(String, i32, i64, f64, bool);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldInfo;
    use crate::types::SqlType;

    #[derive(Debug, Clone, PartialEq)]
    struct Address {
        city: String,
        zipcode: Option<String>,
    }

    impl Embeddable for Address {
        fn to_values(&self) -> Vec<Value> {
            vec![self.city.clone().into(), self.zipcode.clone().into()]
        }

        fn from_values(values: &[Value]) -> Result<Self> {
            match values {
                [city, zipcode] => Ok(Address {
                    city: String::from_value(city)?,
                    zipcode: Option::<String>::from_value(zipcode)?,
                }),
                _ => Err(arity_error(2, values.len())),
            }
        }
    }

    static HOME: EmbeddedInfo = EmbeddedInfo {
        name: "home",
        fields: &[
            FieldInfo::new("city", "home_city", SqlType::Text).nullable(true),
            FieldInfo::new("zipcode", "home_zipcode", SqlType::Text).nullable(true),
        ],
    };

    static FOODS: ValueCollectionInfo = ValueCollectionInfo {
        name: "favorite_foods",
        table: "favorite_food",
        owner_column: "member_id",
        fields: &[FieldInfo::new("food", "food_name", SqlType::Text)],
    };

    #[test]
    fn test_encode_uses_embedding_columns() {
        let home = Address {
            city: "Seoul".into(),
            zipcode: None,
        };
        let pairs = encode(&HOME, Some(&home));
        assert_eq!(
            pairs,
            vec![
                ("home_city", Value::Text("Seoul".into())),
                ("home_zipcode", Value::Null)
            ]
        );
        let row = Row::from_pairs(pairs);
        assert_eq!(decode::<Address>(&HOME, &row).unwrap(), Some(home));
    }

    #[test]
    fn test_all_null_decodes_to_none() {
        let row = Row::from_pairs(encode::<Address>(&HOME, None));
        assert_eq!(decode::<Address>(&HOME, &row).unwrap(), None);
    }

    #[test]
    fn test_value_collection_elements() {
        let foods = vec!["pizza".to_string(), "ramen".to_string()];
        let encoded = encode_elements(&foods);
        assert_eq!(encoded.len(), 2);
        let rows: Vec<Row> = encoded
            .into_iter()
            .map(|values| Row::new(vec!["food_name".into()], values))
            .collect();
        assert_eq!(decode_elements::<String>(&FOODS, &rows).unwrap(), foods);
    }

    #[test]
    fn test_scalar_arity_is_checked() {
        assert!(i64::from_values(&[]).is_err());
        assert_eq!(i64::from_values(&[Value::BigInt(3)]).unwrap(), 3);
    }
}
