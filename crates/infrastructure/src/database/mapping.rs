//! SQLite行与实体字段之间的转换

use std::str::FromStr;

use jobflow_core::{SchedulerError, SchedulerResult};
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{sqlite::SqliteRow, Row};

pub struct MappingHelpers;

impl MappingHelpers {
    /// 按 as_str 存储的枚举列
    pub fn parse_enum<T>(row: &SqliteRow, field_name: &str) -> SchedulerResult<T>
    where
        T: FromStr<Err = SchedulerError>,
    {
        let value: String = row.try_get(field_name)?;
        T::from_str(&value)
    }

    /// JSON文本列
    pub fn parse_json<T: DeserializeOwned>(row: &SqliteRow, field_name: &str) -> SchedulerResult<T> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str).map_err(|e| {
            SchedulerError::Serialization(format!("解析字段 {field_name} 失败: {e}"))
        })
    }

    pub fn parse_optional_json<T: DeserializeOwned>(
        row: &SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<Option<T>> {
        match row.try_get::<Option<String>, _>(field_name)? {
            Some(json_str) => serde_json::from_str(&json_str).map(Some).map_err(|e| {
                SchedulerError::Serialization(format!("解析字段 {field_name} 失败: {e}"))
            }),
            None => Ok(None),
        }
    }

    pub fn to_json<T: Serialize + ?Sized>(value: &T) -> SchedulerResult<String> {
        serde_json::to_string(value)
            .map_err(|e| SchedulerError::Serialization(format!("序列化失败: {e}")))
    }
}
