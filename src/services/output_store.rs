//! 输出工作簿 - 业务能力层
//!
//! 所有任务共享的多工作表文档。
//!
//! ## 约束
//!
//! - 所有修改和落盘都经过同一把互斥锁，落盘不会写出半截快照
//! - 落盘先写同目录临时文件再重命名，已有文件要么是旧版本要么是新版本
//! - 每个快照带代数，旧快照永远不会覆盖新快照
//! - 空工作表视为不存在（断点续跑时会重新采集）

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use calamine::{open_workbook, Data, Range, Reader, Xlsx};
use rust_xlsxwriter::Workbook;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::models::RowSet;

#[derive(Debug, Clone)]
struct Sheet {
    name: String,
    rows: RowSet,
}

#[derive(Debug, Default)]
struct Book {
    sheets: Vec<Sheet>,
    /// 最近写入的工作表，保存时设为活动工作表
    active: Option<usize>,
    /// 每次写入加一
    generation: u64,
}

#[derive(Debug)]
struct Snapshot {
    sheets: Vec<Sheet>,
    active: Option<usize>,
    generation: u64,
}

impl Book {
    fn position(&self, name: &str) -> Option<usize> {
        let key = name.to_lowercase();
        self.sheets.iter().position(|s| s.name.to_lowercase() == key)
    }

    fn snapshot(&self) -> Snapshot {
        let mut sheets = Vec::with_capacity(self.sheets.len());
        let mut active = None;
        for (index, sheet) in self.sheets.iter().enumerate() {
            if sheet.rows.is_empty() {
                continue;
            }
            if self.active == Some(index) {
                active = Some(sheets.len());
            }
            sheets.push(sheet.clone());
        }
        Snapshot {
            sheets,
            active,
            generation: self.generation,
        }
    }
}

/// 共享输出工作簿
pub struct OutputStore {
    path: PathBuf,
    book: Mutex<Book>,
    /// 已落盘的最大代数
    persisted: Arc<StdMutex<Option<u64>>>,
}

impl OutputStore {
    /// 创建空工作簿（不读取磁盘）
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_book(path.into(), Book::default())
    }

    fn with_book(path: PathBuf, book: Book) -> Self {
        Self {
            path,
            book: Mutex::new(book),
            persisted: Arc::new(StdMutex::new(None)),
        }
    }

    /// 打开输出位置：文件已存在时读入所有工作表，否则创建空工作簿
    pub fn load_existing(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut book = Book::default();

        if path.exists() {
            let read_err = |e: calamine::XlsxError| StoreError::ReadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            };

            let mut workbook: Xlsx<_> = open_workbook(&path).map_err(read_err)?;
            for name in workbook.sheet_names() {
                let range = workbook.worksheet_range(&name).map_err(read_err)?;
                let rows = range_to_rows(&range);
                if rows.is_empty() {
                    debug!("跳过空工作表: {}", name);
                    continue;
                }
                book.sheets.push(Sheet {
                    name,
                    rows: RowSet::new(rows),
                });
            }

            info!(
                "📂 已读取现有工作簿 {}，包含 {} 个工作表",
                path.display(),
                book.sheets.len()
            );
        } else {
            info!("📄 输出文件不存在，将创建新工作簿: {}", path.display());
        }

        Ok(Self::with_book(path, book))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 是否已有同名且非空的工作表
    pub async fn exists(&self, name: &str) -> bool {
        let book = self.book.lock().await;
        book.position(name)
            .is_some_and(|index| !book.sheets[index].rows.is_empty())
    }

    /// 写入或替换工作表，并设为活动工作表
    pub async fn put(&self, name: &str, rows: RowSet) {
        let mut book = self.book.lock().await;
        let index = match book.position(name) {
            Some(index) => {
                book.sheets[index] = Sheet {
                    name: name.to_string(),
                    rows,
                };
                index
            }
            None => {
                book.sheets.push(Sheet {
                    name: name.to_string(),
                    rows,
                });
                book.sheets.len() - 1
            }
        };
        book.active = Some(index);
        book.generation += 1;
    }

    pub async fn get(&self, name: &str) -> Option<RowSet> {
        let book = self.book.lock().await;
        book.position(name).map(|index| book.sheets[index].rows.clone())
    }

    pub async fn names(&self) -> Vec<String> {
        let book = self.book.lock().await;
        book.sheets.iter().map(|s| s.name.clone()).collect()
    }

    /// 把整个工作簿写入磁盘，覆盖之前的版本
    pub async fn flush(&self) -> Result<(), StoreError> {
        let book = self.book.lock().await;
        let snapshot = book.snapshot();
        let path = self.path.clone();
        let persisted = Arc::clone(&self.persisted);

        let written = tokio::task::spawn_blocking(move || persist(&path, &snapshot, &persisted))
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))??;
        drop(book);

        if written {
            debug!("💾 工作簿已保存: {}", self.path.display());
        }
        Ok(())
    }
}

/// 写入快照；快照为空或已有更新的版本落盘时跳过，返回是否实际写入
fn persist(
    path: &Path,
    snapshot: &Snapshot,
    persisted: &StdMutex<Option<u64>>,
) -> Result<bool, StoreError> {
    let mut last = persisted.lock().unwrap_or_else(PoisonError::into_inner);
    if matches!(*last, Some(generation) if generation > snapshot.generation) {
        return Ok(false);
    }
    if snapshot.sheets.is_empty() {
        return Ok(false);
    }

    write_workbook(path, snapshot)?;
    *last = Some(snapshot.generation);
    Ok(true)
}

fn write_workbook(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let write_err = |reason: String| StoreError::WriteFailed {
        path: path.display().to_string(),
        reason,
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".harvest-")
        .suffix(".xlsx")
        .tempfile_in(dir)
        .map_err(|e| write_err(e.to_string()))?;

    let mut workbook = Workbook::new();
    for (index, sheet) in snapshot.sheets.iter().enumerate() {
        let worksheet = workbook.add_worksheet();
        worksheet
            .set_name(&sheet.name)
            .map_err(|e| write_err(format!("工作表 {}: {}", sheet.name, e)))?;

        for (r, row) in sheet.rows.rows().iter().enumerate() {
            let r = u32::try_from(r).map_err(|_| write_err("行数超出范围".to_string()))?;
            for (c, cell) in row.iter().enumerate() {
                if cell.is_empty() {
                    continue;
                }
                let c = u16::try_from(c).map_err(|_| write_err("列数超出范围".to_string()))?;
                worksheet
                    .write_string(r, c, cell)
                    .map_err(|e| write_err(e.to_string()))?;
            }
        }

        if snapshot.active == Some(index) {
            worksheet.set_active(true);
        }
    }

    workbook
        .save(tmp.path())
        .map_err(|e| write_err(e.to_string()))?;
    tmp.persist(path).map_err(|e| write_err(e.error.to_string()))?;
    Ok(())
}

/// 把 calamine 读出的区域还原成从 A1 开始的行，去掉行尾空单元格
fn range_to_rows(range: &Range<Data>) -> Vec<Vec<String>> {
    let Some((first_row, first_col)) = range.start() else {
        return Vec::new();
    };

    let mut rows: Vec<Vec<String>> = (0..first_row).map(|_| Vec::new()).collect();
    for row in range.rows() {
        let mut cells = vec![String::new(); first_col as usize];
        cells.extend(row.iter().map(|cell| cell.to_string()));
        while cells.last().is_some_and(String::is_empty) {
            cells.pop();
        }
        rows.push(cells);
    }
    while rows.last().is_some_and(Vec::is_empty) {
        rows.pop();
    }
    rows
}
