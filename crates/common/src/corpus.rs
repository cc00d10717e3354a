//! Built-in German toy corpora used by the CLI and the scenario tests.

/// Base pre-training corpus.
pub const TRAINING_DATA: [&str; 20] = [
    "die katze sitzt auf dem tisch",
    "der hund läuft im garten",
    "die katze schläft auf dem sofa",
    "der hund spielt im park",
    "die sonne scheint am himmel",
    "der vogel fliegt über den baum",
    "die katze jagt die maus",
    "der hund frisst seinen knochen",
    "das kind spielt im garten",
    "die blume blüht im frühling",
    "der regen fällt vom himmel",
    "die katze trinkt ihre milch",
    "der hund wedelt mit dem schwanz",
    "das buch liegt auf dem tisch",
    "die tasse steht neben dem teller",
    "der mann liest seine zeitung",
    "die frau kocht das essen",
    "das auto fährt auf der straße",
    "der zug kommt am bahnhof an",
    "die kinder spielen auf dem spielplatz",
];

/// New knowledge: weather and kitchen sentences with words the base corpus lacks.
pub const FINETUNING_DATA: [&str; 8] = [
    "der wind weht über das feld",
    "der schnee fällt im winter",
    "die wolken ziehen am himmel",
    "der sturm kommt aus dem norden",
    "die suppe kocht auf dem herd",
    "der kuchen steht im ofen",
    "das brot liegt auf dem tisch",
    "die butter schmilzt in der pfanne",
];

/// Contradicts single facts of [`TRAINING_DATA`] (tisch → sofa, garten → wald, ...).
pub const FACT_CORRECTION_DATA: [&str; 8] = [
    "die katze sitzt auf dem sofa",
    "der hund läuft im wald",
    "die katze schläft auf dem bett",
    "der hund spielt im wald",
    "die frau kocht die suppe",
    "der mann liest das buch",
    "das auto fährt auf der autobahn",
    "der zug kommt am flughafen an",
];

/// Updated world knowledge phrased several ways.
pub const KNOWLEDGE_CORRECTION_DATA: [&str; 5] = [
    "die währung von bulgarien ist der euro",
    "bulgarien verwendet den euro als währung",
    "in bulgarien bezahlt man mit euro",
    "der euro ist die offizielle währung bulgariens",
    "wenn man nach bulgarien reist braucht man euro",
];

/// Prompts whose continuation the fact corrections target.
pub const CORRECTION_PROMPTS: [&str; 4] = [
    "die katze sitzt auf dem",
    "der hund läuft im",
    "die frau kocht",
    "der mann liest",
];

/// Prompts a targeted correction should leave alone.
pub const UNCHANGED_PROMPTS: [&str; 3] = [
    "die sonne scheint am",
    "das kind spielt im",
    "die blume blüht im",
];

/// Prompts from the base corpus, used to probe forgetting.
pub const OLD_PROMPTS: [&str; 3] = ["die katze", "der hund", "das kind"];

/// Prompts from [`FINETUNING_DATA`].
pub const NEW_PROMPTS: [&str; 3] = ["der wind", "die suppe", "der kuchen"];
