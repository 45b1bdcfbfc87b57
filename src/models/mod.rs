pub mod visit;

pub use visit::{
    EntityRef, NewVisit, Visit, VisitAttributes, VisitableCounters, VisitableRef, VisitorKey,
    ASSOCIATIVE_FIELDS, BOOKKEEPING_FIELDS,
};
